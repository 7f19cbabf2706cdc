//! Tracing setup for hosts embedding the control plane.

use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Environment variable naming a directory for per-process log files.
pub const LOG_DIR_ENV: &str = "XENO_LOG_DIR";

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
	pub verbose: bool,
	/// Overrides [`LOG_DIR_ENV`].
	pub log_dir: Option<PathBuf>,
}

impl LogConfig {
	pub fn from_env() -> Self {
		Self {
			verbose: false,
			log_dir: std::env::var_os(LOG_DIR_ENV).map(PathBuf::from),
		}
	}

	fn filter(&self) -> EnvFilter {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if self.verbose {
				EnvFilter::new("xeno_embed=debug,xeno_rpc=debug,xeno_event=debug,info")
			} else {
				EnvFilter::new("xeno_embed=info,xeno_rpc=info,xeno_event=info,warn")
			}
		})
	}
}

/// Installs the global subscriber. Returns `false` if one was already set.
///
/// With a log directory, output goes to `xeno-embed.<pid>.log` there;
/// otherwise to stderr.
pub fn init(config: &LogConfig) -> bool {
	if let Some(log_dir) = &config.log_dir
		&& std::fs::create_dir_all(log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("xeno-embed.{}.log", std::process::id()));
		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			let installed = tracing_subscriber::registry().with(config.filter()).with(file_layer).try_init().is_ok();
			if installed {
				tracing::info!(path = ?log_path, "embed tracing initialized");
			}
			return installed;
		}
	}

	// Fallback to stderr-only logging
	tracing_subscriber::fmt()
		.with_env_filter(config.filter())
		.with_writer(std::io::stderr)
		.try_init()
		.is_ok()
}
