//! Non-allocating framing over a byte stream of msgpack values.
//!
//! The scanner walks markers and length prefixes only, so a hostile length
//! prefix is rejected against [`Limits`] before anything is allocated for it.

use rmp::Marker;

use crate::error::ProtocolError;

/// Default bound on a single message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
/// Default bound on container nesting.
pub const DEFAULT_MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
	pub max_message_size: usize,
	pub max_depth: usize,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
			max_depth: DEFAULT_MAX_DEPTH,
		}
	}
}

/// Outcome of scanning the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
	/// A complete value occupies the first `n` bytes.
	Complete(usize),
	/// More bytes are needed.
	Incomplete,
}

/// Returns the byte length of the first complete value in `buf`.
pub fn scan_value(buf: &[u8], limits: &Limits) -> Result<Scan, ProtocolError> {
	Scanner::default().scan(buf, limits)
}

/// Resumable scan over a growing buffer.
///
/// The scanner remembers where the last incomplete scan stopped, so feeding a
/// large value in chunks walks each byte of it once. The buffer may only grow
/// between calls; [`reset`](Self::reset) after consuming a complete value.
#[derive(Debug, Default)]
pub struct Scanner {
	/// Start of the first element not yet fully buffered.
	pos: usize,
	/// Remaining child count for each open container.
	open: Vec<usize>,
	steps: u64,
}

impl Scanner {
	pub fn reset(&mut self) {
		self.pos = 0;
		self.open.clear();
	}

	/// Markers examined since creation, resumed attempts included.
	pub fn steps(&self) -> u64 {
		self.steps
	}

	/// Continues scanning `buf` from where the previous call stopped.
	pub fn scan(&mut self, buf: &[u8], limits: &Limits) -> Result<Scan, ProtocolError> {
		loop {
			let start = self.pos;
			let Some(&byte) = buf.get(start) else {
				return Ok(Scan::Incomplete);
			};
			self.steps += 1;
			let mut pos = start + 1;

			let (payload, children) = match Marker::from_u8(byte) {
				Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => (Len::Fixed(0), 0),
				Marker::U8 | Marker::I8 => (Len::Fixed(1), 0),
				Marker::U16 | Marker::I16 => (Len::Fixed(2), 0),
				Marker::U32 | Marker::I32 | Marker::F32 => (Len::Fixed(4), 0),
				Marker::U64 | Marker::I64 | Marker::F64 => (Len::Fixed(8), 0),
				Marker::FixStr(n) => (Len::Fixed(usize::from(n)), 0),
				Marker::Str8 | Marker::Bin8 => (Len::Prefixed(1), 0),
				Marker::Str16 | Marker::Bin16 => (Len::Prefixed(2), 0),
				Marker::Str32 | Marker::Bin32 => (Len::Prefixed(4), 0),
				Marker::FixExt1 => (Len::Fixed(2), 0),
				Marker::FixExt2 => (Len::Fixed(3), 0),
				Marker::FixExt4 => (Len::Fixed(5), 0),
				Marker::FixExt8 => (Len::Fixed(9), 0),
				Marker::FixExt16 => (Len::Fixed(17), 0),
				Marker::Ext8 => (Len::PrefixedExt(1), 0),
				Marker::Ext16 => (Len::PrefixedExt(2), 0),
				Marker::Ext32 => (Len::PrefixedExt(4), 0),
				Marker::FixArray(n) => (Len::Fixed(0), usize::from(n)),
				Marker::FixMap(n) => (Len::Fixed(0), usize::from(n) * 2),
				marker @ (Marker::Array16 | Marker::Array32 | Marker::Map16 | Marker::Map32) => {
					let width = if matches!(marker, Marker::Array16 | Marker::Map16) { 2 } else { 4 };
					let Some(n) = read_len(buf, pos, width) else {
						return Ok(Scan::Incomplete);
					};
					pos += width;
					let per_entry = if matches!(marker, Marker::Map16 | Marker::Map32) { 2 } else { 1 };
					// Every child needs at least one byte.
					if n.saturating_mul(per_entry) > limits.max_message_size {
						return Err(ProtocolError::TooLarge {
							limit: limits.max_message_size,
						});
					}
					(Len::Fixed(0), n * per_entry)
				}
				Marker::Reserved => return Err(ProtocolError::ReservedMarker),
			};

			let skip = match payload {
				Len::Fixed(n) => n,
				Len::Prefixed(width) | Len::PrefixedExt(width) => {
					let Some(n) = read_len(buf, pos, width) else {
						return Ok(Scan::Incomplete);
					};
					pos += width;
					// The ext type byte follows the length.
					if matches!(payload, Len::PrefixedExt(_)) { n.saturating_add(1) } else { n }
				}
			};

			pos = pos.saturating_add(skip);
			if pos > limits.max_message_size {
				return Err(ProtocolError::TooLarge {
					limit: limits.max_message_size,
				});
			}
			if pos > buf.len() {
				return Ok(Scan::Incomplete);
			}
			self.pos = pos;

			if children > 0 {
				if self.open.len() >= limits.max_depth {
					return Err(ProtocolError::TooDeep { limit: limits.max_depth });
				}
				self.open.push(children);
				continue;
			}

			// A value just finished; close every container it completes.
			loop {
				let Some(remaining) = self.open.last_mut() else {
					return Ok(Scan::Complete(pos));
				};
				*remaining -= 1;
				if *remaining > 0 {
					break;
				}
				self.open.pop();
			}
		}
	}
}

#[derive(Debug, Clone, Copy)]
enum Len {
	Fixed(usize),
	Prefixed(usize),
	PrefixedExt(usize),
}

fn read_len(buf: &[u8], pos: usize, width: usize) -> Option<usize> {
	let bytes = buf.get(pos..pos + width)?;
	let n = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
	usize::try_from(n).ok()
}
