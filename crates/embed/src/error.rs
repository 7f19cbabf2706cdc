use std::io;

/// Errors raised by the embedding layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	#[error(transparent)]
	Event(#[from] xeno_event::Error),
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error("invalid configuration: {0}")]
	Config(#[from] toml::de::Error),
	#[error("invalid address `{0}`")]
	Address(String),
	#[error("already listening on {0}")]
	AlreadyListening(String),
	/// The process's own stdio is already bound to a channel.
	#[error("stdio channel already open")]
	StdioInUse,
}

/// Failures of the job API that are reported synchronously.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JobError {
	/// The configured number of concurrent jobs is already running.
	#[error("job table is full ({max} jobs)")]
	TableFull { max: usize },
	#[error("cannot start a job with an empty argv")]
	EmptyArgv,
	#[error("failed to spawn `{program}`: {source}")]
	Spawn {
		program: String,
		#[source]
		source: io::Error,
	},
	#[error("failed to signal job: {0}")]
	Signal(#[source] xeno_event::Error),
}

impl JobError {
	pub(crate) fn from_spawn(program: &str, err: xeno_event::Error) -> Self {
		match err {
			xeno_event::Error::EmptyArgv => Self::EmptyArgv,
			xeno_event::Error::Spawn { program, source } => Self::Spawn { program, source },
			other => Self::Spawn {
				program: program.to_owned(),
				source: io::Error::other(other.to_string()),
			},
		}
	}
}

/// Result type for embedding operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
