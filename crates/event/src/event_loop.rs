//! The loop core: one current-thread tokio runtime that only makes progress
//! inside [`EventLoop::wait`], plus the two root queues every callback goes
//! through.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, EnterGuard, Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};

use crate::queue::MultiQueue;
use crate::{Error, Result};

/// Single-threaded reactor owning the I/O driver and the event queues.
///
/// `fast_events` carries I/O-side work that must run promptly (stream data,
/// accepted connections, protocol decoding); `events` carries work deferred
/// to the host's safe points (job callbacks, deferred handlers, timers,
/// worker results).
pub struct EventLoop<C> {
	runtime: Option<Runtime>,
	handle: Handle,
	wake: Arc<Notify>,
	fast_events: MultiQueue<C>,
	events: MultiQueue<C>,
}

impl<C: 'static> EventLoop<C> {
	pub fn new() -> Result<Self> {
		let runtime = Builder::new_current_thread().enable_all().build().map_err(Error::Runtime)?;
		let handle = runtime.handle().clone();
		let wake = Arc::new(Notify::new());
		Ok(Self {
			runtime: Some(runtime),
			handle,
			fast_events: MultiQueue::with_waker(Arc::clone(&wake)),
			events: MultiQueue::with_waker(Arc::clone(&wake)),
			wake,
		})
	}

	pub fn fast_events(&self) -> &MultiQueue<C> {
		&self.fast_events
	}

	pub fn events(&self) -> &MultiQueue<C> {
		&self.events
	}

	/// A `Send` handle for pumps and worker threads.
	pub fn handle(&self) -> LoopHandle<C> {
		LoopHandle {
			runtime: self.handle.clone(),
			wake: Arc::clone(&self.wake),
			fast_events: self.fast_events.clone(),
			events: self.events.clone(),
		}
	}

	/// Enters the runtime context so tokio I/O objects can be registered.
	pub fn enter(&self) -> EnterGuard<'_> {
		self.handle.enter()
	}

	/// Blocks until something is queued, the loop is woken, or `timeout`
	/// elapses. `None` waits indefinitely; a zero timeout drives one round of
	/// I/O without sleeping.
	///
	/// This is the only place where pumps, timers and accept loops run.
	pub fn wait(&self, timeout: Option<Duration>) {
		let Some(runtime) = &self.runtime else {
			return;
		};
		let timeout = if self.fast_events.is_empty() { timeout } else { Some(Duration::ZERO) };
		let wake = &self.wake;
		runtime.block_on(async move {
			match timeout {
				Some(timeout) if timeout.is_zero() => {
					// First yield lets the driver collect readiness, second runs the woken tasks.
					tokio::task::yield_now().await;
					tokio::task::yield_now().await;
				}
				Some(timeout) => {
					let _ = tokio::time::timeout(timeout, wake.notified()).await;
				}
				None => wake.notified().await,
			}
		});
	}

	/// Wakes a pending or future [`wait`](Self::wait).
	pub fn wake(&self) {
		self.wake.notify_one();
	}

	pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		self.handle.spawn(fut)
	}

	/// Queues `event` onto `queue` after `after` has elapsed.
	pub fn timer(&self, after: Duration, queue: &MultiQueue<C>, event: impl FnOnce(&mut C) + Send + 'static) -> TimerHandle {
		self.handle().timer(after, queue, event)
	}

	/// Runs `work` on the blocking pool and hands its result to `done` on the
	/// main queue.
	pub fn spawn_blocking<F, R, D>(&self, work: F, done: D)
	where
		F: FnOnce() -> R + Send + 'static,
		R: Send + 'static,
		D: FnOnce(&mut C, R) + Send + 'static,
	{
		self.handle().spawn_blocking(work, done);
	}
}

impl<C> Drop for EventLoop<C> {
	fn drop(&mut self) {
		// Blocking readers (stdin) would otherwise hold the shutdown forever.
		if let Some(runtime) = self.runtime.take() {
			runtime.shutdown_background();
		}
	}
}

/// Cloneable, `Send` view of an [`EventLoop`].
pub struct LoopHandle<C> {
	runtime: Handle,
	wake: Arc<Notify>,
	fast_events: MultiQueue<C>,
	events: MultiQueue<C>,
}

impl<C> Clone for LoopHandle<C> {
	fn clone(&self) -> Self {
		Self {
			runtime: self.runtime.clone(),
			wake: Arc::clone(&self.wake),
			fast_events: self.fast_events.clone(),
			events: self.events.clone(),
		}
	}
}

impl<C: 'static> LoopHandle<C> {
	pub fn fast_events(&self) -> &MultiQueue<C> {
		&self.fast_events
	}

	pub fn events(&self) -> &MultiQueue<C> {
		&self.events
	}

	pub fn runtime(&self) -> &Handle {
		&self.runtime
	}

	pub fn wake(&self) {
		self.wake.notify_one();
	}

	pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		self.runtime.spawn(fut)
	}

	pub fn timer(&self, after: Duration, queue: &MultiQueue<C>, event: impl FnOnce(&mut C) + Send + 'static) -> TimerHandle {
		let queue = queue.clone();
		let task = self.runtime.spawn(async move {
			tokio::time::sleep(after).await;
			queue.push(event);
		});
		TimerHandle { abort: task.abort_handle() }
	}

	pub fn spawn_blocking<F, R, D>(&self, work: F, done: D)
	where
		F: FnOnce() -> R + Send + 'static,
		R: Send + 'static,
		D: FnOnce(&mut C, R) + Send + 'static,
	{
		tracing::trace!("loop.spawn_blocking");
		let events = self.events.clone();
		let work = self.runtime.spawn_blocking(work);
		self.runtime.spawn(async move {
			match work.await {
				Ok(value) => {
					events.push(move |cx: &mut C| done(cx, value));
				}
				Err(err) => tracing::error!(error = %err, "blocking work failed"),
			}
		});
	}
}

/// Cancels a scheduled timer. Dropping the handle leaves the timer armed.
#[derive(Debug)]
pub struct TimerHandle {
	abort: AbortHandle,
}

impl TimerHandle {
	pub fn cancel(&self) {
		self.abort.abort();
	}

	pub fn is_finished(&self) -> bool {
		self.abort.is_finished()
	}
}
