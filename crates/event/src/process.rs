//! Child-process primitive.
//!
//! The OS exit notification is observed by tokio's SIGCHLD machinery, which
//! only records the fact in signal context. The waiter task turns it into an
//! event on the caller's queue, so the exit callback always runs on the tick.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::AbortHandle;

use crate::event_loop::LoopHandle;
use crate::queue::MultiQueue;
use crate::{Error, Result};

/// Exit status reported when waiting on the child itself failed.
pub const WAIT_FAILED_STATUS: i32 = -1;

/// How to start a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
	pub argv: Vec<String>,
	/// Extra environment entries applied on top of the inherited environment.
	pub env: Vec<(String, String)>,
	/// Start from an empty environment instead of inheriting.
	pub clear_env: bool,
	pub cwd: Option<PathBuf>,
	pub stdin: bool,
	pub stdout: bool,
	pub stderr: bool,
}

impl ProcessOptions {
	pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			argv: argv.into_iter().map(Into::into).collect(),
			stdin: true,
			stdout: true,
			stderr: true,
			..Self::default()
		}
	}
}

/// Standard streams handed back by [`Process::spawn`]; `None` for discarded ones.
#[derive(Debug, Default)]
pub struct ProcessIo {
	pub stdin: Option<ChildStdin>,
	pub stdout: Option<ChildStdout>,
	pub stderr: Option<ChildStderr>,
}

/// A spawned child whose exit is reported through the event queue.
#[derive(Debug)]
pub struct Process {
	pid: u32,
	exited: Arc<AtomicBool>,
	waiter: AbortHandle,
}

impl Process {
	/// Spawns the child described by `options`.
	///
	/// `on_exit` is queued on `queue` exactly once with the exit status: the
	/// exit code, or `128 + signal` when the child was killed by a signal.
	pub fn spawn<C, F>(handle: &LoopHandle<C>, options: &ProcessOptions, queue: MultiQueue<C>, on_exit: F) -> Result<(Self, ProcessIo)>
	where
		C: 'static,
		F: FnOnce(&mut C, i32) + Send + 'static,
	{
		let Some((program, args)) = options.argv.split_first() else {
			return Err(Error::EmptyArgv);
		};

		let mut cmd = Command::new(program);
		cmd.args(args)
			.stdin(if options.stdin { Stdio::piped() } else { Stdio::null() })
			.stdout(if options.stdout { Stdio::piped() } else { Stdio::null() })
			.stderr(if options.stderr { Stdio::piped() } else { Stdio::null() })
			.kill_on_drop(false);
		if options.clear_env {
			cmd.env_clear();
		}
		cmd.envs(options.env.iter().map(|(k, v)| (k, v)));
		if let Some(cwd) = &options.cwd {
			cmd.current_dir(cwd);
		}
		cmd.process_group(0);

		let mut child = {
			let _guard = handle.runtime().enter();
			cmd.spawn().map_err(|source| Error::Spawn {
				program: program.clone(),
				source,
			})?
		};
		let Some(pid) = child.id() else {
			return Err(Error::Spawn {
				program: program.clone(),
				source: std::io::Error::other("child exited before its pid was read"),
			});
		};

		let io = ProcessIo {
			stdin: child.stdin.take(),
			stdout: child.stdout.take(),
			stderr: child.stderr.take(),
		};

		let exited = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&exited);
		let waiter = handle.spawn(async move {
			let status = match child.wait().await {
				Ok(status) => exit_code(status),
				Err(err) => {
					tracing::error!(pid, error = %err, "process.wait.error");
					WAIT_FAILED_STATUS
				}
			};
			flag.store(true, Ordering::Release);
			tracing::debug!(pid, status, "process.exit");
			queue.push(move |cx: &mut C| on_exit(cx, status));
		});

		tracing::debug!(pid, program = %program, "process.spawn");
		Ok((
			Self {
				pid,
				exited,
				waiter: waiter.abort_handle(),
			},
			io,
		))
	}

	pub fn pid(&self) -> u32 {
		self.pid
	}

	pub fn has_exited(&self) -> bool {
		self.exited.load(Ordering::Acquire)
	}

	/// Sends `signal` to the child's process group, so descendants it started
	/// are reached too. Returns `Ok(false)` when the child is already gone.
	pub fn signal(&self, signal: Signal) -> Result<bool> {
		if self.has_exited() {
			return Ok(false);
		}
		let Ok(raw) = i32::try_from(self.pid) else {
			return Ok(false);
		};
		// The child leads its own group, see `process_group(0)` in `spawn`.
		match signal::killpg(Pid::from_raw(raw), signal) {
			Ok(()) => Ok(true),
			Err(Errno::ESRCH) => Ok(false),
			Err(source) => Err(Error::Signal { pid: self.pid, source }),
		}
	}

	pub fn terminate(&self) -> Result<bool> {
		self.signal(Signal::SIGTERM)
	}

	pub fn kill(&self) -> Result<bool> {
		self.signal(Signal::SIGKILL)
	}

	/// Stops watching the child and leaves it running. Its exit is never
	/// reported; tokio still reaps it once it is gone.
	pub fn detach(&self) {
		self.waiter.abort();
		tracing::debug!(pid = self.pid, "process.detach");
	}
}

/// Folds an [`ExitStatus`] into the single integer callbacks receive.
pub fn exit_code(status: ExitStatus) -> i32 {
	match (status.code(), status.signal()) {
		(Some(code), _) => code,
		(None, Some(signal)) => 128 + signal,
		(None, None) => WAIT_FAILED_STATUS,
	}
}
