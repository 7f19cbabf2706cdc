//! Tunables of the embedding layer.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use xeno_rpc::Limits;

use crate::Result;

/// Limits and timeouts for jobs and channels.
///
/// Loadable from TOML; every field is optional and falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbedConfig {
	/// Maximum number of concurrently live jobs.
	pub max_jobs: usize,
	/// Ring buffer size of each job output stream.
	pub job_buffer_size: usize,
	/// Ring buffer size of each channel input stream.
	pub channel_buffer_size: usize,
	/// Queued output above which a channel refuses new requests.
	pub max_pending_write_bytes: usize,
	/// Largest accepted inbound message.
	pub max_message_size: usize,
	/// Deepest accepted container nesting in an inbound message.
	pub max_nesting_depth: usize,
	/// Grace period between SIGTERM and SIGKILL in `job_stop`.
	pub kill_timeout_ms: u64,
	/// How long an exited job waits for its output pipes to reach EOF.
	pub exit_flush_timeout_ms: u64,
	/// Default timeout of outbound requests; `None` waits forever.
	pub request_timeout_ms: Option<u64>,
	/// Port used when a TCP listen address has none.
	pub default_tcp_port: u16,
}

impl Default for EmbedConfig {
	fn default() -> Self {
		Self {
			max_jobs: 100,
			job_buffer_size: 0xFFFF,
			channel_buffer_size: 0x10000,
			max_pending_write_bytes: 16 * 1024 * 1024,
			max_message_size: xeno_rpc::frame::DEFAULT_MAX_MESSAGE_SIZE,
			max_nesting_depth: xeno_rpc::frame::DEFAULT_MAX_DEPTH,
			kill_timeout_ms: 2000,
			exit_flush_timeout_ms: 100,
			request_timeout_ms: None,
			default_tcp_port: 7450,
		}
	}
}

impl EmbedConfig {
	pub fn from_toml_str(s: &str) -> Result<Self> {
		Ok(toml::from_str(s)?)
	}

	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let text = std::fs::read_to_string(path)?;
		Self::from_toml_str(&text)
	}

	/// Set the maximum number of live jobs.
	pub fn max_jobs(mut self, max: usize) -> Self {
		self.max_jobs = max;
		self
	}

	/// Set the SIGTERM to SIGKILL grace period.
	pub fn kill_timeout(mut self, timeout: Duration) -> Self {
		self.kill_timeout_ms = duration_ms(timeout);
		self
	}

	/// Set how long exited jobs wait for trailing output.
	pub fn exit_flush_timeout(mut self, timeout: Duration) -> Self {
		self.exit_flush_timeout_ms = duration_ms(timeout);
		self
	}

	/// Set the default outbound request timeout.
	pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.request_timeout_ms = timeout.map(duration_ms);
		self
	}

	/// Set the write queue bound of channels.
	pub fn max_pending_write_bytes(mut self, bytes: usize) -> Self {
		self.max_pending_write_bytes = bytes;
		self
	}

	pub fn kill_timeout_duration(&self) -> Duration {
		Duration::from_millis(self.kill_timeout_ms)
	}

	pub fn exit_flush_duration(&self) -> Duration {
		Duration::from_millis(self.exit_flush_timeout_ms)
	}

	pub fn request_timeout_duration(&self) -> Option<Duration> {
		self.request_timeout_ms.map(Duration::from_millis)
	}

	pub fn limits(&self) -> Limits {
		Limits {
			max_message_size: self.max_message_size,
			max_depth: self.max_nesting_depth,
		}
	}
}

fn duration_ms(d: Duration) -> u64 {
	u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
