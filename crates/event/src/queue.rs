//! Deferred-callback queues with parent/child linking.
//!
//! A root queue holds events in global arrival order. A child queue holds the
//! events of one source (a job, a channel, a stream); every push into a child
//! also appends a link entry to the root, so draining the root runs child
//! events in the same global order. Draining a child directly removes the
//! matching links, and closing a child cancels its events without disturbing
//! anything else in the root.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::Notify;

/// A deferred callback run against the scheduler context `C`.
pub type Event<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChildKey {
	slot: usize,
	generation: u64,
}

enum Entry<C> {
	Event(Event<C>),
	Link(ChildKey),
}

struct ChildQueue<C> {
	generation: u64,
	events: VecDeque<Event<C>>,
}

struct State<C> {
	root: VecDeque<Entry<C>>,
	children: Slab<ChildQueue<C>>,
	next_generation: u64,
	closed: bool,
}

impl<C> State<C> {
	fn child_mut(&mut self, key: ChildKey) -> Option<&mut ChildQueue<C>> {
		self.children.get_mut(key.slot).filter(|child| child.generation == key.generation)
	}

	fn unlink_one(&mut self, key: ChildKey) {
		if let Some(pos) = self.root.iter().position(|entry| matches!(entry, Entry::Link(k) if *k == key)) {
			self.root.remove(pos);
		}
	}

	fn unlink_all(&mut self, key: ChildKey) {
		self.root.retain(|entry| !matches!(entry, Entry::Link(k) if *k == key));
	}
}

struct Shared<C> {
	state: Mutex<State<C>>,
	waker: Option<Arc<Notify>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
	Root,
	Child(ChildKey),
}

/// Handle to a root queue or to one of its children.
///
/// Handles are cheap to clone and may be moved to other threads; pushing from
/// a worker thread wakes the loop waiting on the queue's [`Notify`].
pub struct MultiQueue<C> {
	shared: Arc<Shared<C>>,
	scope: Scope,
}

impl<C> Clone for MultiQueue<C> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
			scope: self.scope,
		}
	}
}

impl<C> fmt::Debug for MultiQueue<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MultiQueue").field("scope", &self.scope).field("len", &self.len()).finish()
	}
}

impl<C> Default for MultiQueue<C> {
	fn default() -> Self {
		Self::new()
	}
}

impl<C> MultiQueue<C> {
	/// Creates a root queue that wakes nobody on push.
	pub fn new() -> Self {
		Self::build(None)
	}

	/// Creates a root queue that calls `notify_one` on `waker` after each push.
	pub fn with_waker(waker: Arc<Notify>) -> Self {
		Self::build(Some(waker))
	}

	fn build(waker: Option<Arc<Notify>>) -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(State {
					root: VecDeque::new(),
					children: Slab::new(),
					next_generation: 0,
					closed: false,
				}),
				waker,
			}),
			scope: Scope::Root,
		}
	}

	/// Creates a child queue linked into this queue's root.
	///
	/// Children are always attached to the root, even when created from
	/// another child handle.
	pub fn child(&self) -> Self {
		let mut state = self.shared.state.lock();
		let generation = state.next_generation;
		state.next_generation += 1;
		let slot = state.children.insert(ChildQueue {
			generation,
			events: VecDeque::new(),
		});
		Self {
			shared: Arc::clone(&self.shared),
			scope: Scope::Child(ChildKey { slot, generation }),
		}
	}

	pub fn is_root(&self) -> bool {
		self.scope == Scope::Root
	}

	/// Queues `event`. Returns `false` when the queue has been closed.
	pub fn push(&self, event: impl FnOnce(&mut C) + Send + 'static) -> bool {
		self.push_boxed(Box::new(event))
	}

	pub fn push_boxed(&self, event: Event<C>) -> bool {
		{
			let mut state = self.shared.state.lock();
			if state.closed {
				return false;
			}
			match self.scope {
				Scope::Root => state.root.push_back(Entry::Event(event)),
				Scope::Child(key) => {
					let Some(child) = state.child_mut(key) else {
						return false;
					};
					child.events.push_back(event);
					state.root.push_back(Entry::Link(key));
				}
			}
		}
		if let Some(waker) = &self.shared.waker {
			waker.notify_one();
		}
		true
	}

	/// Removes the next event in this queue's order.
	pub fn pop(&self) -> Option<Event<C>> {
		let mut state = self.shared.state.lock();
		match self.scope {
			Scope::Root => {
				while let Some(entry) = state.root.pop_front() {
					match entry {
						Entry::Event(event) => return Some(event),
						Entry::Link(key) => {
							if let Some(event) = state.child_mut(key).and_then(|child| child.events.pop_front()) {
								return Some(event);
							}
						}
					}
				}
				None
			}
			Scope::Child(key) => {
				let event = state.child_mut(key)?.events.pop_front()?;
				state.unlink_one(key);
				Some(event)
			}
		}
	}

	pub fn len(&self) -> usize {
		let mut state = self.shared.state.lock();
		match self.scope {
			Scope::Root => state.root.len(),
			Scope::Child(key) => state.child_mut(key).map_or(0, |child| child.events.len()),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Runs every event that is queued when the drain starts.
	///
	/// Events pushed by the callbacks themselves are left for the next drain.
	/// Returns the number of callbacks run.
	pub fn process(&self, ctx: &mut C) -> usize {
		let budget = self.len();
		let mut ran = 0;
		while ran < budget {
			let Some(event) = self.pop() else {
				break;
			};
			event(ctx);
			ran += 1;
		}
		ran
	}

	/// Drops every queued event without running it.
	pub fn purge(&self) {
		let mut root = VecDeque::new();
		let mut children = Vec::new();
		{
			let mut state = self.shared.state.lock();
			match self.scope {
				Scope::Root => {
					root = std::mem::take(&mut state.root);
					children.extend(state.children.iter_mut().map(|(_, child)| std::mem::take(&mut child.events)));
				}
				Scope::Child(key) => {
					if let Some(child) = state.child_mut(key) {
						children.push(std::mem::take(&mut child.events));
					}
					state.unlink_all(key);
				}
			}
		}
		// Dropped outside the lock: event captures may own queue handles.
		drop(root);
		drop(children);
	}

	/// Purges the queue and refuses further pushes.
	pub fn close(&self) {
		let removed = {
			let mut state = self.shared.state.lock();
			match self.scope {
				Scope::Root => {
					state.closed = true;
					None
				}
				Scope::Child(key) => {
					state.unlink_all(key);
					if state.child_mut(key).is_some() {
						Some(state.children.remove(key.slot))
					} else {
						None
					}
				}
			}
		};
		drop(removed);
		if self.is_root() {
			self.purge();
		}
	}

	pub fn is_closed(&self) -> bool {
		let mut state = self.shared.state.lock();
		match self.scope {
			Scope::Root => state.closed,
			Scope::Child(key) => state.closed || state.child_mut(key).is_none(),
		}
	}
}
