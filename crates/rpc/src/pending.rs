//! Correlation table for requests a channel has sent and not yet seen answered.

use std::collections::{HashMap, HashSet};

use crate::error::CallError;
use crate::protocol::CounterIdGen;

/// Result of matching a response id against the table.
#[derive(Debug, PartialEq)]
pub enum Lookup<T> {
	/// The request was in flight; its entry is handed back.
	Pending(T),
	/// The request already timed out; the late response should be dropped.
	TimedOut,
	/// The id was never issued by this channel, or was answered already.
	Unknown,
}

/// In-flight outbound requests keyed by id.
///
/// Every entry leaves the table exactly once: through [`complete`],
/// [`time_out`], or [`drain`].
///
/// [`complete`]: PendingTable::complete
/// [`time_out`]: PendingTable::time_out
/// [`drain`]: PendingTable::drain
#[derive(Debug)]
pub struct PendingTable<T> {
	ids: CounterIdGen,
	inflight: HashMap<u64, T>,
	/// Ids that timed out and are waiting for their late response.
	timed_out: HashSet<u64>,
}

impl<T> Default for PendingTable<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> PendingTable<T> {
	pub fn new() -> Self {
		Self::with_ids(CounterIdGen::new())
	}

	fn with_ids(ids: CounterIdGen) -> Self {
		Self {
			ids,
			inflight: HashMap::new(),
			timed_out: HashSet::new(),
		}
	}

	/// Allocates a fresh id for `entry`, skipping ids still in use.
	pub fn insert(&mut self, entry: T) -> Result<u64, CallError> {
		let in_use = self.inflight.len() + self.timed_out.len();
		for _ in 0..=in_use {
			let id = self.ids.next();
			if !self.inflight.contains_key(&id) && !self.timed_out.contains(&id) {
				self.inflight.insert(id, entry);
				return Ok(id);
			}
		}
		Err(CallError::IdSpaceExhausted)
	}

	pub fn get(&self, id: u64) -> Option<&T> {
		self.inflight.get(&id)
	}

	pub fn get_mut(&mut self, id: u64) -> Option<&mut T> {
		self.inflight.get_mut(&id)
	}

	/// Matches a response against the table.
	///
	/// A late response for a timed-out id frees that id for reuse.
	pub fn complete(&mut self, id: u64) -> Lookup<T> {
		if let Some(entry) = self.inflight.remove(&id) {
			return Lookup::Pending(entry);
		}
		if self.timed_out.remove(&id) {
			return Lookup::TimedOut;
		}
		Lookup::Unknown
	}

	/// Removes `id` and remembers it as timed out. Returns `None` when the
	/// request was already answered.
	pub fn time_out(&mut self, id: u64) -> Option<T> {
		let entry = self.inflight.remove(&id)?;
		self.timed_out.insert(id);
		Some(entry)
	}

	/// Removes every in-flight entry, lowest id first.
	pub fn drain(&mut self) -> Vec<(u64, T)> {
		self.timed_out.clear();
		let mut entries: Vec<_> = self.inflight.drain().collect();
		entries.sort_unstable_by_key(|(id, _)| *id);
		entries
	}

	pub fn len(&self) -> usize {
		self.inflight.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inflight.is_empty()
	}

	pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
		self.inflight.keys().copied()
	}
}
