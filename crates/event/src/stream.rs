//! Reader and writer pumps bridging async OS handles to the loop queues.
//!
//! A [`ReadStream`] owns a [`RingBuffer`]; its pump task fills the ring and
//! queues a [`ReadNotice`] onto the owner's queue. A [`WriteStream`] owns an
//! ordered queue of pending buffers drained by its pump task. Pumps only run
//! while the loop is inside [`EventLoop::wait`](crate::EventLoop::wait).

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::AbortHandle;

use crate::event_loop::LoopHandle;
use crate::queue::MultiQueue;
use crate::rbuffer::RingBuffer;
use crate::{Error, Result};

const MAX_READ_CHUNK: usize = 64 * 1024;

/// What a reader pump reports to its owner.
#[derive(Debug)]
pub enum ReadNotice {
	/// New bytes are buffered.
	Data,
	/// The peer closed its end. Buffered bytes may remain.
	Eof,
	/// The read failed; the pump has stopped.
	Error(io::Error),
}

/// What a writer pump reports to its owner.
#[derive(Debug)]
pub enum WriteNotice {
	/// A write failed; queued data was discarded and the pump has stopped.
	Error(io::Error),
	/// Everything queued before `close` was flushed and the handle shut down.
	Closed,
}

struct ReadShared {
	buffer: Mutex<RingBuffer>,
	space: Notify,
	data_pending: AtomicBool,
	eof: AtomicBool,
}

/// Read half of a stream with its ring buffer.
pub struct ReadStream {
	shared: Arc<ReadShared>,
	running: watch::Sender<bool>,
	task: Option<AbortHandle>,
}

impl ReadStream {
	/// Starts a pump reading `reader` into a ring of `capacity` bytes.
	///
	/// `on_notice` runs on the tick, in order, from `queue`. At most one
	/// [`ReadNotice::Data`] is outstanding at a time; draining the stream
	/// re-arms it.
	pub fn spawn<C, R, F>(handle: &LoopHandle<C>, reader: R, capacity: usize, queue: MultiQueue<C>, on_notice: F) -> Self
	where
		C: 'static,
		R: AsyncRead + Unpin + Send + 'static,
		F: Fn(&mut C, ReadNotice) + Send + Sync + 'static,
	{
		let shared = Arc::new(ReadShared {
			buffer: Mutex::new(RingBuffer::new(capacity)),
			space: Notify::new(),
			data_pending: AtomicBool::new(false),
			eof: AtomicBool::new(false),
		});
		let (running, running_rx) = watch::channel(true);
		let task = handle.spawn(read_pump(reader, Arc::clone(&shared), running_rx, queue, Arc::new(on_notice)));
		Self {
			shared,
			running,
			task: Some(task.abort_handle()),
		}
	}

	/// Resumes polling after [`stop`](Self::stop).
	pub fn start(&self) {
		self.running.send_replace(true);
	}

	/// Pauses polling; bytes already buffered stay readable.
	pub fn stop(&self) {
		self.running.send_replace(false);
	}

	pub fn available(&self) -> usize {
		self.shared.buffer.lock().available_read()
	}

	pub fn is_eof(&self) -> bool {
		self.shared.eof.load(Ordering::Acquire)
	}

	pub fn is_closed(&self) -> bool {
		self.task.is_none()
	}

	/// Moves every buffered byte into `out` and re-arms the data notice.
	pub fn drain_into(&self, out: &mut Vec<u8>) -> usize {
		self.shared.data_pending.store(false, Ordering::Release);
		let n = self.shared.buffer.lock().drain_into(out);
		if n > 0 {
			self.shared.space.notify_one();
		}
		n
	}

	/// Copies up to `out.len()` buffered bytes out and consumes them.
	pub fn read(&self, out: &mut [u8]) -> usize {
		self.shared.data_pending.store(false, Ordering::Release);
		let n = self.shared.buffer.lock().read(out);
		if n > 0 {
			self.shared.space.notify_one();
		}
		n
	}

	/// Stops the pump and releases the OS handle.
	///
	/// `on_closed` is queued behind every notice already queued on `queue`,
	/// so it observes the stream only after those callbacks have run.
	pub fn close<C: 'static>(&mut self, queue: &MultiQueue<C>, on_closed: impl FnOnce(&mut C) + Send + 'static) {
		if let Some(task) = self.task.take() {
			task.abort();
			queue.push(on_closed);
		}
	}
}

impl Drop for ReadStream {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

async fn read_pump<C, R, F>(mut reader: R, shared: Arc<ReadShared>, mut running: watch::Receiver<bool>, queue: MultiQueue<C>, on_notice: Arc<F>)
where
	C: 'static,
	R: AsyncRead + Unpin + Send + 'static,
	F: Fn(&mut C, ReadNotice) + Send + Sync + 'static,
{
	let notify = |notice: ReadNotice| {
		let on_notice = Arc::clone(&on_notice);
		queue.push(move |cx: &mut C| on_notice(cx, notice))
	};
	let capacity = shared.buffer.lock().size();
	let mut scratch = vec![0u8; capacity.min(MAX_READ_CHUNK)];

	loop {
		if running.wait_for(|on| *on).await.is_err() {
			return;
		}
		let free = shared.buffer.lock().available_write();
		if free == 0 {
			shared.space.notified().await;
			continue;
		}

		let want = free.min(scratch.len());
		match reader.read(&mut scratch[..want]).await {
			Ok(0) => {
				shared.eof.store(true, Ordering::Release);
				notify(ReadNotice::Eof);
				return;
			}
			Ok(n) => {
				shared.buffer.lock().write(&scratch[..n]);
				if !shared.data_pending.swap(true, Ordering::AcqRel) {
					notify(ReadNotice::Data);
				}
			}
			Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
			Err(err) => {
				tracing::debug!(error = %err, "stream.read.error");
				shared.eof.store(true, Ordering::Release);
				notify(ReadNotice::Error(err));
				return;
			}
		}
	}
}

/// Write half of a stream: an ordered queue of pending buffers.
pub struct WriteStream {
	tx: Option<mpsc::UnboundedSender<Bytes>>,
	pending: Arc<AtomicUsize>,
	failed: Arc<AtomicBool>,
}

impl WriteStream {
	pub fn spawn<C, W, F>(handle: &LoopHandle<C>, writer: W, queue: MultiQueue<C>, on_notice: F) -> Self
	where
		C: 'static,
		W: AsyncWrite + Unpin + Send + 'static,
		F: FnOnce(&mut C, WriteNotice) + Send + 'static,
	{
		let (tx, rx) = mpsc::unbounded_channel();
		let pending = Arc::new(AtomicUsize::new(0));
		let failed = Arc::new(AtomicBool::new(false));
		handle.spawn(write_pump(writer, rx, Arc::clone(&pending), Arc::clone(&failed), queue, on_notice));
		Self {
			tx: Some(tx),
			pending,
			failed,
		}
	}

	/// Queues `data` behind everything written before. Never blocks.
	pub fn write(&self, data: Bytes) -> Result<()> {
		if self.failed.load(Ordering::Acquire) {
			return Err(Error::StreamClosed);
		}
		let Some(tx) = &self.tx else {
			return Err(Error::StreamClosed);
		};
		let len = data.len();
		self.pending.fetch_add(len, Ordering::AcqRel);
		if tx.send(data).is_err() {
			self.pending.fetch_sub(len, Ordering::AcqRel);
			return Err(Error::StreamClosed);
		}
		Ok(())
	}

	/// Bytes queued but not yet accepted by the OS.
	pub fn pending_bytes(&self) -> usize {
		self.pending.load(Ordering::Acquire)
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_none() || self.failed.load(Ordering::Acquire)
	}

	/// Refuses new writes; the pump flushes what is queued, then shuts down.
	pub fn close(&mut self) {
		self.tx = None;
	}
}

async fn write_pump<C, W, F>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>, pending: Arc<AtomicUsize>, failed: Arc<AtomicBool>, queue: MultiQueue<C>, on_notice: F)
where
	C: 'static,
	W: AsyncWrite + Unpin + Send + 'static,
	F: FnOnce(&mut C, WriteNotice) + Send + 'static,
{
	while let Some(chunk) = rx.recv().await {
		let len = chunk.len();
		let mut result = writer.write_all(&chunk).await;
		if result.is_ok() && rx.is_empty() {
			result = writer.flush().await;
		}
		pending.fetch_sub(len, Ordering::AcqRel);
		if let Err(err) = result {
			tracing::debug!(error = %err, "stream.write.error");
			failed.store(true, Ordering::Release);
			rx.close();
			pending.store(0, Ordering::Release);
			queue.push(move |cx: &mut C| on_notice(cx, WriteNotice::Error(err)));
			return;
		}
	}
	let _ = writer.flush().await;
	let _ = writer.shutdown().await;
	queue.push(move |cx: &mut C| on_notice(cx, WriteNotice::Closed));
}
