//! The explicit scheduler context.
//!
//! [`Scheduler`] owns the event loop, the job and channel tables, the
//! listeners and the method table. Every callback receives it as `&mut`, so
//! state is only ever touched from the tick; several instances can coexist
//! in one process.

use std::time::{Duration, Instant};

use tokio::runtime::EnterGuard;
use xeno_event::{EventLoop, LoopHandle, MultiQueue, TimerHandle};
use xeno_rpc::{ChannelId, Dispatcher, HandlerEntry};

use crate::channel::ChannelTable;
use crate::config::EmbedConfig;
use crate::job::JobTable;
use crate::transport::Listener;
use crate::{Error, Result};

/// Called after a channel has been fully closed.
pub type CloseHook = Box<dyn FnMut(&mut Scheduler, ChannelId) + Send>;

/// Scheduler context passed to every job, channel and handler callback.
pub struct Scheduler {
	pub(crate) event_loop: EventLoop<Scheduler>,
	pub(crate) config: EmbedConfig,
	pub(crate) dispatcher: Dispatcher<Scheduler>,
	pub(crate) jobs: JobTable,
	pub(crate) channels: ChannelTable,
	pub(crate) listeners: Vec<Listener>,
	pub(crate) close_hooks: Vec<CloseHook>,
	pub(crate) stdio_channel: Option<ChannelId>,
	stopped: bool,
}

impl Scheduler {
	pub fn new(config: EmbedConfig) -> Result<Self> {
		let event_loop = EventLoop::new().map_err(Error::Event)?;
		Ok(Self {
			event_loop,
			jobs: JobTable::new(config.max_jobs),
			channels: ChannelTable::default(),
			config,
			dispatcher: Dispatcher::new(),
			listeners: Vec::new(),
			close_hooks: Vec::new(),
			stdio_channel: None,
			stopped: false,
		})
	}

	pub fn config(&self) -> &EmbedConfig {
		&self.config
	}

	pub fn dispatcher(&self) -> &Dispatcher<Self> {
		&self.dispatcher
	}

	pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<Self> {
		&mut self.dispatcher
	}

	/// Registers a handler; see [`xeno_rpc::Method`].
	pub fn register(&mut self, entry: HandlerEntry<Self>) {
		if self.dispatcher.register(entry).is_some() {
			tracing::debug!("embed.register.replaced");
		}
	}

	/// Observes channel teardown, after pending requests have been failed.
	pub fn on_channel_close(&mut self, hook: impl FnMut(&mut Scheduler, ChannelId) + Send + 'static) {
		self.close_hooks.push(Box::new(hook));
	}

	/// A `Send` handle for worker threads; pushes wake the loop.
	pub fn handle(&self) -> LoopHandle<Self> {
		self.event_loop.handle()
	}

	/// Enters the runtime so tokio I/O objects can be created outside a callback.
	pub fn enter(&self) -> EnterGuard<'_> {
		self.event_loop.enter()
	}

	/// Runs `event` on the main queue after `after`.
	pub fn timer(&self, after: Duration, event: impl FnOnce(&mut Scheduler) + Send + 'static) -> TimerHandle {
		self.event_loop.timer(after, self.event_loop.events(), event)
	}

	/// Queues `event` for the next [`process_events`](Self::process_events).
	pub fn defer(&self, event: impl FnOnce(&mut Scheduler) + Send + 'static) {
		self.event_loop.events().push(event);
	}

	/// Runs blocking `work` on a worker thread and hands the result to `done`
	/// on the main queue.
	pub fn spawn_blocking<F, R, D>(&self, work: F, done: D)
	where
		F: FnOnce() -> R + Send + 'static,
		R: Send + 'static,
		D: FnOnce(&mut Scheduler, R) + Send + 'static,
	{
		self.event_loop.spawn_blocking(work, done);
	}

	/// Polls I/O once and drains the I/O-side queue.
	///
	/// Stream data is decoded and fast handlers run here; deferred work waits
	/// for [`process_events`](Self::process_events).
	pub fn poll_io(&mut self, timeout: Option<Duration>) {
		self.event_loop.wait(timeout);
		self.process_fast_events();
	}

	pub(crate) fn process_fast_events(&mut self) -> usize {
		let queue = self.event_loop.fast_events().clone();
		queue.process(self)
	}

	/// Runs deferred work queued so far: job callbacks, deferred handlers,
	/// request continuations, timers and worker results.
	pub fn process_events(&mut self) -> usize {
		let queue = self.event_loop.events().clone();
		queue.process(self)
	}

	/// One full tick: poll, then drain both queues.
	pub fn run_once(&mut self, timeout: Option<Duration>) {
		let timeout = if self.event_loop.events().is_empty() { timeout } else { Some(Duration::ZERO) };
		self.poll_io(timeout);
		self.process_events();
	}

	/// Ticks until `done` holds or `timeout` elapses. Returns whether `done` held.
	pub fn run_until(&mut self, timeout: Option<Duration>, mut done: impl FnMut(&mut Scheduler) -> bool) -> bool {
		let deadline = timeout.map(|t| Instant::now() + t);
		loop {
			if done(self) {
				return true;
			}
			let remaining = match deadline {
				Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
					Some(left) if !left.is_zero() => Some(left),
					_ => return done(self),
				},
				None => None,
			};
			self.run_once(remaining);
		}
	}

	/// Ticks until [`stop`](Self::stop) is called.
	pub fn run(&mut self) {
		self.stopped = false;
		while !self.stopped {
			self.run_once(None);
		}
	}

	/// Makes [`run`](Self::run) return after the current tick.
	pub fn stop(&mut self) {
		self.stopped = true;
		self.event_loop.wake();
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped
	}

	/// Ticks while draining only `queues` from the main queue; events from
	/// other sources stay queued. The I/O-side queue is always drained.
	pub(crate) fn run_focused(&mut self, queues: &[MultiQueue<Scheduler>], timeout: Option<Duration>, mut done: impl FnMut(&mut Scheduler) -> bool) -> bool {
		let deadline = timeout.map(|t| Instant::now() + t);
		loop {
			self.process_fast_events();
			for queue in queues {
				queue.process(self);
			}
			if done(self) {
				return true;
			}
			let remaining = match deadline {
				Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
					Some(left) if !left.is_zero() => Some(left),
					_ => return false,
				},
				None => None,
			};
			let pending = queues.iter().any(|queue| !queue.is_empty());
			self.event_loop.wait(if pending { Some(Duration::ZERO) } else { remaining });
		}
	}

	/// Stops every job, closes every channel and listener, and ticks until
	/// all of them are gone or `timeout` elapses. Detached jobs are released
	/// and keep running.
	pub fn teardown(&mut self, timeout: Duration) -> bool {
		tracing::info!(jobs = self.jobs.len(), channels = self.channels.len(), "embed.teardown");
		self.listeners.clear();
		self.release_detached_jobs();
		for id in self.attached_job_ids() {
			if let Err(err) = self.job_stop(id) {
				tracing::warn!(job = %id, error = %err, "embed.teardown.job_stop");
			}
		}
		for id in self.channel_ids() {
			self.close_channel(id);
		}
		self.run_until(Some(timeout), |sched| sched.jobs.is_empty() && sched.channels.is_empty())
	}
}

impl std::fmt::Debug for Scheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scheduler")
			.field("jobs", &self.jobs.len())
			.field("channels", &self.channels.len())
			.field("listeners", &self.listeners.len())
			.field("stopped", &self.stopped)
			.finish_non_exhaustive()
	}
}
