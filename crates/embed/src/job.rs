//! Job control: child processes with callbacks on the scheduler tick.
//!
//! Every job gets a child of the main queue. Its output notices, exit
//! notice, flush and kill timers all go through that queue, so closing it on
//! reap cancels whatever a dead job still had in flight, and a reused id can
//! never observe a predecessor's events.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use xeno_event::{MultiQueue, Process, ProcessOptions, ReadNotice, ReadStream, TimerHandle, WriteNotice, WriteStream};
use xeno_rpc::ChannelId;

use crate::channel::ChannelSource;
use crate::error::JobError;
use crate::scheduler::Scheduler;

/// Small integer job id, unique among live jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "job {}", self.0)
	}
}

/// Receives output chunks. The last call for a stream has `eof` set.
pub type OutputCallback = Box<dyn FnMut(&mut Scheduler, JobId, &[u8], bool) + Send>;
/// Receives the exit status once, after trailing output.
pub type ExitCallback = Box<dyn FnOnce(&mut Scheduler, JobId, i32) + Send>;

/// Lifecycle of a job. Reaped jobs are no longer in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
	Spawning,
	Running,
	/// The process is gone; trailing output or the exit callback is pending.
	Exited,
	Reaped,
}

/// Outcome of [`Scheduler::job_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWait {
	Exited(i32),
	TimedOut,
	NotFound,
}

/// How to start a job.
pub struct JobOptions {
	argv: Vec<String>,
	env: Vec<(String, String)>,
	clear_env: bool,
	cwd: Option<PathBuf>,
	stdin: bool,
	rpc: bool,
	detach: bool,
	stdout_buffered: bool,
	stderr_buffered: bool,
	on_stdout: Option<OutputCallback>,
	on_stderr: Option<OutputCallback>,
	on_exit: Option<ExitCallback>,
}

impl fmt::Debug for JobOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobOptions")
			.field("argv", &self.argv)
			.field("cwd", &self.cwd)
			.field("stdin", &self.stdin)
			.field("rpc", &self.rpc)
			.field("detach", &self.detach)
			.finish_non_exhaustive()
	}
}

impl JobOptions {
	pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			argv: argv.into_iter().map(Into::into).collect(),
			env: Vec::new(),
			clear_env: false,
			cwd: None,
			stdin: true,
			rpc: false,
			detach: false,
			stdout_buffered: false,
			stderr_buffered: false,
			on_stdout: None,
			on_stderr: None,
			on_exit: None,
		}
	}

	/// Sets one environment variable on top of the inherited environment.
	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.push((key.into(), value.into()));
		self
	}

	/// Starts from an empty environment.
	pub fn clear_env(mut self) -> Self {
		self.clear_env = true;
		self
	}

	pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
		self.cwd = Some(cwd.into());
		self
	}

	/// Connects stdin to `/dev/null`.
	pub fn no_stdin(mut self) -> Self {
		self.stdin = false;
		self
	}

	/// Speaks msgpack-RPC over the child's stdin and stdout.
	pub fn rpc(mut self) -> Self {
		self.rpc = true;
		self
	}

	/// Leaves the job running when the scheduler is torn down.
	pub fn detach(mut self) -> Self {
		self.detach = true;
		self
	}

	/// Collects stdout and hands it to the callback once, at EOF.
	pub fn stdout_buffered(mut self) -> Self {
		self.stdout_buffered = true;
		self
	}

	/// Collects stderr and hands it to the callback once, at EOF.
	pub fn stderr_buffered(mut self) -> Self {
		self.stderr_buffered = true;
		self
	}

	/// Without a stdout callback (and outside RPC mode) stdout is discarded.
	pub fn on_stdout(mut self, f: impl FnMut(&mut Scheduler, JobId, &[u8], bool) + Send + 'static) -> Self {
		self.on_stdout = Some(Box::new(f));
		self
	}

	/// Without a stderr callback stderr is discarded.
	pub fn on_stderr(mut self, f: impl FnMut(&mut Scheduler, JobId, &[u8], bool) + Send + 'static) -> Self {
		self.on_stderr = Some(Box::new(f));
		self
	}

	pub fn on_exit(mut self, f: impl FnOnce(&mut Scheduler, JobId, i32) + Send + 'static) -> Self {
		self.on_exit = Some(Box::new(f));
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
	Stdout,
	Stderr,
}

struct OutputPipe {
	stream: ReadStream,
	callback: Option<OutputCallback>,
	eof: bool,
	buffered: bool,
	collected: Vec<u8>,
}

impl OutputPipe {
	/// Drains the stream; returns the chunk due for the callback, if any.
	fn take_chunk(&mut self, eof: bool) -> Option<Vec<u8>> {
		if self.buffered {
			self.stream.drain_into(&mut self.collected);
			return eof.then(|| std::mem::take(&mut self.collected));
		}
		let mut data = Vec::new();
		self.stream.drain_into(&mut data);
		(!data.is_empty() || eof).then_some(data)
	}
}

pub(crate) struct Job {
	serial: u64,
	state: JobState,
	process: Process,
	stdin: Option<WriteStream>,
	stdout: Option<OutputPipe>,
	stderr: Option<OutputPipe>,
	on_exit: Option<ExitCallback>,
	status: Option<i32>,
	stopping: bool,
	detached: bool,
	kill_timer: Option<TimerHandle>,
	flush_timer: Option<TimerHandle>,
	channel: Option<ChannelId>,
	queue: MultiQueue<Scheduler>,
}

impl Job {
	fn pipe_mut(&mut self, which: Output) -> Option<&mut OutputPipe> {
		match which {
			Output::Stdout => self.stdout.as_mut(),
			Output::Stderr => self.stderr.as_mut(),
		}
	}

	fn output_done(&self) -> bool {
		self.stdout.as_ref().is_none_or(|pipe| pipe.eof) && self.stderr.as_ref().is_none_or(|pipe| pipe.eof)
	}
}

/// Live jobs, plus the last exit status recorded for each id.
pub(crate) struct JobTable {
	max: usize,
	jobs: BTreeMap<JobId, Job>,
	exits: HashMap<JobId, (u64, i32)>,
	next_serial: u64,
}

impl fmt::Debug for JobTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobTable")
			.field("max", &self.max)
			.field("live", &self.jobs.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl JobTable {
	pub(crate) fn new(max: usize) -> Self {
		Self {
			max,
			jobs: BTreeMap::new(),
			exits: HashMap::new(),
			next_serial: 0,
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.jobs.len()
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.jobs.is_empty()
	}

	/// Smallest id in `1..=max` not held by a live job.
	fn free_id(&self) -> Option<JobId> {
		let max = u32::try_from(self.max).unwrap_or(u32::MAX);
		(1..=max).map(JobId).find(|id| !self.jobs.contains_key(id))
	}

	pub(crate) fn detach_channel(&mut self, id: JobId, channel: ChannelId) {
		if let Some(job) = self.jobs.get_mut(&id)
			&& job.channel == Some(channel)
		{
			job.channel = None;
		}
	}
}

impl Scheduler {
	/// Spawns a job. Its callbacks run on the tick, from the main queue.
	pub fn job_start(&mut self, options: JobOptions) -> Result<JobId, JobError> {
		let JobOptions {
			argv,
			env,
			clear_env,
			cwd,
			stdin,
			rpc,
			detach,
			stdout_buffered,
			stderr_buffered,
			on_stdout,
			on_stderr,
			on_exit,
		} = options;
		let id = self.jobs.free_id().ok_or(JobError::TableFull { max: self.jobs.max })?;
		let program = argv.first().cloned().unwrap_or_default();

		let process_options = ProcessOptions {
			argv,
			env,
			clear_env,
			cwd,
			stdin: stdin || rpc,
			stdout: rpc || on_stdout.is_some(),
			stderr: on_stderr.is_some(),
		};
		let queue = self.event_loop.events().child();
		let handle = self.event_loop.handle();
		let (process, io) = Process::spawn(&handle, &process_options, queue.clone(), move |sched: &mut Scheduler, status| {
			sched.on_job_exit(id, status);
		})
		.map_err(|err| {
			queue.close();
			JobError::from_spawn(&program, err)
		})?;

		let capacity = self.config.job_buffer_size;
		let pipe = |stream: ReadStream, callback: Option<OutputCallback>, buffered: bool| {
			Some(OutputPipe {
				stream,
				callback,
				eof: false,
				buffered,
				collected: Vec::new(),
			})
		};
		let stderr = io.stderr.and_then(|reader| {
			let stream = ReadStream::spawn(&handle, reader, capacity, queue.clone(), move |sched: &mut Scheduler, notice| {
				sched.on_job_output(id, Output::Stderr, notice);
			});
			pipe(stream, on_stderr, stderr_buffered)
		});

		let serial = self.jobs.next_serial;
		self.jobs.next_serial += 1;
		self.jobs.exits.remove(&id);

		let mut job = Job {
			serial,
			state: JobState::Spawning,
			process,
			stdin: None,
			stdout: None,
			stderr,
			on_exit,
			status: None,
			stopping: false,
			detached: detach,
			kill_timer: None,
			flush_timer: None,
			channel: None,
			queue: queue.clone(),
		};

		if rpc {
			if let (Some(writer), Some(reader)) = (io.stdin, io.stdout) {
				let channel = self.open_channel_with(ChannelSource::Job(id), Box::new(reader), Box::new(writer));
				job.channel = Some(channel);
			}
		} else {
			job.stdin = io.stdin.map(|writer| {
				WriteStream::spawn(&handle, writer, queue.clone(), move |sched: &mut Scheduler, notice| {
					sched.on_job_stdin(id, notice);
				})
			});
			job.stdout = io.stdout.and_then(|reader| {
				let stream = ReadStream::spawn(&handle, reader, capacity, queue.clone(), move |sched: &mut Scheduler, notice| {
					sched.on_job_output(id, Output::Stdout, notice);
				});
				pipe(stream, on_stdout, stdout_buffered)
			});
		}

		job.state = JobState::Running;
		tracing::info!(job = %id, pid = job.process.pid(), program = %program, rpc, detach, "job.start");
		self.jobs.jobs.insert(id, job);
		Ok(id)
	}

	/// Closes stdin, sends SIGTERM and escalates to SIGKILL after the kill
	/// timeout. Returns `Ok(false)` for unknown or already exited jobs.
	pub fn job_stop(&mut self, id: JobId) -> Result<bool, JobError> {
		let kill_after = self.config.kill_timeout_duration();
		let Some(job) = self.jobs.jobs.get_mut(&id) else {
			return Ok(false);
		};
		if job.status.is_some() {
			return Ok(false);
		}
		if job.stopping {
			return Ok(true);
		}
		job.stopping = true;
		if let Some(mut stdin) = job.stdin.take() {
			stdin.close();
		}
		let delivered = job.process.terminate().map_err(JobError::Signal)?;
		tracing::info!(job = %id, pid = job.process.pid(), delivered, "job.stop");
		job.kill_timer = Some(self.event_loop.timer(kill_after, &job.queue, move |sched: &mut Scheduler| sched.kill_job(id)));
		if let Some(channel) = job.channel {
			self.close_channel(channel);
		}
		Ok(true)
	}

	fn kill_job(&mut self, id: JobId) {
		let Some(job) = self.jobs.jobs.get(&id) else {
			return;
		};
		if job.status.is_some() {
			return;
		}
		tracing::warn!(job = %id, pid = job.process.pid(), "job.kill");
		if let Err(err) = job.process.kill() {
			tracing::error!(job = %id, error = %err, "job.kill.failed");
		}
	}

	/// Queues `data` on the job's stdin. Never blocks.
	pub fn job_write(&mut self, id: JobId, data: impl Into<Bytes>) -> bool {
		let Some(stdin) = self.jobs.jobs.get(&id).and_then(|job| job.stdin.as_ref()) else {
			return false;
		};
		stdin.write(data.into()).is_ok()
	}

	/// Flushes and closes the job's stdin.
	pub fn job_close_stdin(&mut self, id: JobId) -> bool {
		let Some(mut stdin) = self.jobs.jobs.get_mut(&id).and_then(|job| job.stdin.take()) else {
			return false;
		};
		stdin.close();
		true
	}

	pub fn job_pid(&self, id: JobId) -> Option<u32> {
		self.jobs.jobs.get(&id).map(|job| job.process.pid())
	}

	pub fn job_ids(&self) -> Vec<JobId> {
		self.jobs.jobs.keys().copied().collect()
	}

	/// The channel of an RPC job, while it is open.
	pub fn job_channel(&self, id: JobId) -> Option<ChannelId> {
		self.jobs.jobs.get(&id).and_then(|job| job.channel)
	}

	pub fn job_state(&self, id: JobId) -> JobState {
		self.jobs.jobs.get(&id).map_or(JobState::Reaped, |job| job.state)
	}

	/// Ticks, focused on this job's events, until it has been reaped.
	///
	/// Events of other jobs and channels stay queued meanwhile. After a
	/// timeout the job keeps running.
	pub fn job_wait(&mut self, id: JobId, timeout: Option<Duration>) -> JobWait {
		let Some(job) = self.jobs.jobs.get(&id) else {
			return match self.jobs.exits.get(&id) {
				Some(&(_, status)) => JobWait::Exited(status),
				None => JobWait::NotFound,
			};
		};
		let serial = job.serial;
		let queue = job.queue.clone();
		let reaped = move |sched: &mut Scheduler| sched.jobs.jobs.get(&id).is_none_or(|job| job.serial != serial);
		if !self.run_focused(&[queue], timeout, reaped) {
			return JobWait::TimedOut;
		}
		match self.jobs.exits.get(&id) {
			Some(&(recorded, status)) if recorded == serial => JobWait::Exited(status),
			_ => JobWait::NotFound,
		}
	}

	/// Ids of live jobs that teardown stops; detached jobs are left out.
	pub(crate) fn attached_job_ids(&self) -> Vec<JobId> {
		self.jobs.jobs.iter().filter(|(_, job)| !job.detached).map(|(&id, _)| id).collect()
	}

	/// Forgets every detached job without signalling it. Its pipes are
	/// closed and its exit is never reported.
	pub(crate) fn release_detached_jobs(&mut self) {
		let detached: Vec<JobId> = self.jobs.jobs.iter().filter(|(_, job)| job.detached && job.status.is_none()).map(|(&id, _)| id).collect();
		for id in detached {
			let Some(mut job) = self.jobs.jobs.remove(&id) else {
				continue;
			};
			tracing::info!(job = %id, pid = job.process.pid(), "job.detach");
			job.process.detach();
			job.queue.close();
			if let Some(mut stdin) = job.stdin.take() {
				stdin.close();
			}
			for pipe in [job.stdout.as_mut(), job.stderr.as_mut()].into_iter().flatten() {
				pipe.stream.close(&job.queue, |_: &mut Scheduler| {});
			}
			if let Some(channel) = job.channel {
				self.close_channel(channel);
			}
		}
	}

	fn on_job_output(&mut self, id: JobId, which: Output, notice: ReadNotice) {
		let Some(job) = self.jobs.jobs.get_mut(&id) else {
			return;
		};
		let Some(pipe) = job.pipe_mut(which) else {
			return;
		};
		if pipe.eof {
			return;
		}
		let eof = match notice {
			ReadNotice::Data => false,
			ReadNotice::Eof => true,
			ReadNotice::Error(err) => {
				tracing::warn!(job = %id, stream = ?which, error = %err, "job.output.error");
				true
			}
		};
		let chunk = pipe.take_chunk(eof);
		pipe.eof = eof;
		let callback = pipe.callback.take();

		if let Some(mut callback) = callback {
			if let Some(data) = chunk {
				callback(self, id, &data, eof);
			}
			if let Some(pipe) = self.jobs.jobs.get_mut(&id).and_then(|job| job.pipe_mut(which)) {
				pipe.callback = Some(callback);
			}
		}

		if eof
			&& let Some(job) = self.jobs.jobs.get(&id)
			&& job.status.is_some()
			&& job.output_done()
		{
			self.finish_job(id);
		}
	}

	fn on_job_stdin(&mut self, id: JobId, notice: WriteNotice) {
		match notice {
			WriteNotice::Error(err) => {
				tracing::debug!(job = %id, error = %err, "job.stdin.error");
				if let Some(job) = self.jobs.jobs.get_mut(&id) {
					job.stdin = None;
				}
			}
			WriteNotice::Closed => tracing::trace!(job = %id, "job.stdin.closed"),
		}
	}

	fn on_job_exit(&mut self, id: JobId, status: i32) {
		let flush = self.config.exit_flush_duration();
		let Some(job) = self.jobs.jobs.get_mut(&id) else {
			return;
		};
		tracing::info!(job = %id, pid = job.process.pid(), status, "job.exit");
		job.status = Some(status);
		job.state = JobState::Exited;
		if let Some(timer) = job.kill_timer.take() {
			timer.cancel();
		}
		if job.output_done() {
			self.finish_job(id);
		} else {
			// Descendants may hold the pipes open long after the child is gone.
			job.flush_timer = Some(self.event_loop.timer(flush, &job.queue, move |sched: &mut Scheduler| sched.finish_job(id)));
		}
	}

	/// Delivers remaining output, runs the exit callback, and reaps.
	fn finish_job(&mut self, id: JobId) {
		let Some(job) = self.jobs.jobs.get_mut(&id) else {
			return;
		};
		let Some(status) = job.status else {
			return;
		};
		if let Some(timer) = job.flush_timer.take() {
			timer.cancel();
		}

		for which in [Output::Stdout, Output::Stderr] {
			let Some(pipe) = self.jobs.jobs.get_mut(&id).and_then(|job| job.pipe_mut(which)) else {
				continue;
			};
			if pipe.eof {
				continue;
			}
			pipe.eof = true;
			let data = pipe.take_chunk(true).unwrap_or_default();
			if let Some(mut callback) = pipe.callback.take() {
				callback(self, id, &data, true);
			}
		}

		let on_exit = self.jobs.jobs.get_mut(&id).and_then(|job| job.on_exit.take());
		if let Some(on_exit) = on_exit {
			on_exit(self, id, status);
		}

		let Some(mut job) = self.jobs.jobs.remove(&id) else {
			return;
		};
		job.state = JobState::Reaped;
		job.queue.close();
		for pipe in [job.stdout.as_mut(), job.stderr.as_mut()].into_iter().flatten() {
			pipe.stream.close(&job.queue, |_: &mut Scheduler| {});
		}
		self.jobs.exits.insert(id, (job.serial, status));
		tracing::debug!(job = %id, status, "job.reaped");
	}
}
