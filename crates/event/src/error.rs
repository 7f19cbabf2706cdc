use std::io;

/// Errors raised by the event loop core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The tokio runtime backing the loop could not be built.
	#[error("failed to build event loop runtime: {0}")]
	Runtime(#[source] io::Error),
	/// The stream has been closed and accepts no more data.
	#[error("stream is closed")]
	StreamClosed,
	/// A process was requested with an empty argument vector.
	#[error("cannot spawn a process from an empty argv")]
	EmptyArgv,
	/// The OS refused to create the child process.
	#[error("failed to spawn `{program}`: {source}")]
	Spawn {
		/// Program name (`argv[0]`).
		program: String,
		/// Underlying OS error.
		#[source]
		source: io::Error,
	},
	/// Signal delivery failed for a reason other than the process being gone.
	#[error("failed to signal process {pid}: {source}")]
	Signal {
		/// Target process id.
		pid: u32,
		/// Errno reported by `kill(2)`.
		#[source]
		source: nix::errno::Errno,
	},
	#[error(transparent)]
	Io(#[from] io::Error),
}

/// Result type for event loop operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
