use std::io;

use bytes::Bytes;

const MIN_CAPACITY: usize = 64;

/// Contiguous append-only byte buffer that grows geometrically.
///
/// Encoders write whole messages here before the bytes are handed to a
/// [`WriteStream`](crate::WriteStream) with [`GrowBuf::freeze`].
#[derive(Debug, Default, Clone)]
pub struct GrowBuf {
	data: Vec<u8>,
}

impl GrowBuf {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			data: Vec::with_capacity(capacity.max(MIN_CAPACITY)),
		}
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.data.capacity()
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.data
	}

	/// Ensures room for `additional` more bytes, at least doubling the
	/// capacity whenever it has to grow.
	pub fn reserve(&mut self, additional: usize) {
		let needed = self.data.len() + additional;
		if needed <= self.data.capacity() {
			return;
		}
		let target = needed.max(self.data.capacity() * 2).max(MIN_CAPACITY);
		self.data.reserve_exact(target - self.data.len());
	}

	pub fn push(&mut self, bytes: &[u8]) {
		self.reserve(bytes.len());
		self.data.extend_from_slice(bytes);
	}

	pub fn push_byte(&mut self, byte: u8) {
		self.reserve(1);
		self.data.push(byte);
	}

	pub fn clear(&mut self) {
		self.data.clear();
	}

	/// Hands the accumulated bytes off without copying.
	pub fn freeze(self) -> Bytes {
		Bytes::from(self.data)
	}

	/// Takes the accumulated bytes, leaving an empty buffer behind.
	pub fn take(&mut self) -> Bytes {
		Bytes::from(std::mem::take(&mut self.data))
	}
}

impl io::Write for GrowBuf {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.push(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}
