//! Fixed-capacity byte ring used as the staging area between a stream pump
//! and the tick that consumes its bytes.

/// Circular byte buffer with a fixed capacity.
///
/// The storage is allocated once and never reallocated. After every operation
/// `available_read() + available_write() == size()`.
#[derive(Debug)]
pub struct RingBuffer {
	buf: Box<[u8]>,
	read_pos: usize,
	write_pos: usize,
	len: usize,
}

impl RingBuffer {
	/// Creates a ring of `size` bytes. A zero size is bumped to one byte.
	pub fn new(size: usize) -> Self {
		Self {
			buf: vec![0; size.max(1)].into_boxed_slice(),
			read_pos: 0,
			write_pos: 0,
			len: 0,
		}
	}

	/// Total capacity in bytes.
	pub fn size(&self) -> usize {
		self.buf.len()
	}

	/// Number of bytes ready to be read.
	pub fn available_read(&self) -> usize {
		self.len
	}

	/// Number of bytes that can be written before the ring is full.
	pub fn available_write(&self) -> usize {
		self.buf.len() - self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn is_full(&self) -> bool {
		self.len == self.buf.len()
	}

	/// Copies as much of `data` as fits and returns the number of bytes taken.
	pub fn write(&mut self, data: &[u8]) -> usize {
		let n = data.len().min(self.available_write());
		let first = n.min(self.buf.len() - self.write_pos);
		self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
		self.buf[..n - first].copy_from_slice(&data[first..n]);
		self.write_pos = (self.write_pos + n) % self.buf.len();
		self.len += n;
		n
	}

	/// Copies up to `out.len()` bytes out of the ring and consumes them.
	pub fn read(&mut self, out: &mut [u8]) -> usize {
		let n = self.peek(out);
		self.consume(n);
		n
	}

	/// Copies up to `out.len()` bytes without consuming them.
	pub fn peek(&self, out: &mut [u8]) -> usize {
		let (head, tail) = self.read_slices();
		let n = out.len().min(self.len);
		let first = n.min(head.len());
		out[..first].copy_from_slice(&head[..first]);
		out[first..n].copy_from_slice(&tail[..n - first]);
		n
	}

	/// The readable region as at most two contiguous slices, oldest first.
	pub fn read_slices(&self) -> (&[u8], &[u8]) {
		let head_len = self.len.min(self.buf.len() - self.read_pos);
		let head = &self.buf[self.read_pos..self.read_pos + head_len];
		let tail = &self.buf[..self.len - head_len];
		(head, tail)
	}

	/// Drops `n` readable bytes. `n` is clamped to `available_read()`.
	pub fn consume(&mut self, n: usize) {
		let n = n.min(self.len);
		self.read_pos = (self.read_pos + n) % self.buf.len();
		self.len -= n;
		if self.len == 0 {
			self.read_pos = 0;
			self.write_pos = 0;
		}
	}

	/// Moves every readable byte into `out`.
	pub fn drain_into(&mut self, out: &mut Vec<u8>) -> usize {
		let (head, tail) = self.read_slices();
		out.reserve(head.len() + tail.len());
		out.extend_from_slice(head);
		out.extend_from_slice(tail);
		let n = self.len;
		self.consume(n);
		n
	}

	/// Empties the ring without touching its storage.
	pub fn reset(&mut self) {
		self.read_pos = 0;
		self.write_pos = 0;
		self.len = 0;
	}
}
