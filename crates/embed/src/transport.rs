//! Transports that produce channels: stdio, listening sockets, outgoing
//! connections.
//!
//! Accepted and connected streams reach the scheduler through the I/O-side
//! queue; channels are only ever created on the tick.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::AbortHandle;
use xeno_event::MultiQueue;
use xeno_rpc::ChannelId;

use crate::channel::{BoxedReader, BoxedWriter, ChannelSource, ChannelState};
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where a channel listens or connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
	/// `host:port`, passed to the resolver as-is.
	Tcp(String),
	Unix(PathBuf),
}

impl Address {
	/// Classifies `addr`.
	///
	/// An `ip:port` pair, a bare ip (which gets `default_port`) or a
	/// `host:port` without slashes is TCP; anything else is a socket path.
	pub fn parse(addr: &str, default_port: u16) -> Result<Self> {
		if addr.is_empty() {
			return Err(Error::Address(addr.to_owned()));
		}
		if let Ok(socket) = addr.parse::<SocketAddr>() {
			return Ok(Self::Tcp(socket.to_string()));
		}
		if let Ok(ip) = addr.parse::<IpAddr>() {
			return Ok(Self::Tcp(SocketAddr::new(ip, default_port).to_string()));
		}
		if !addr.contains('/')
			&& let Some((host, port)) = addr.rsplit_once(':')
			&& !host.is_empty()
			&& port.parse::<u16>().is_ok()
		{
			return Ok(Self::Tcp(addr.to_owned()));
		}
		Ok(Self::Unix(PathBuf::from(addr)))
	}
}

/// An accept loop. Dropping it stops accepting and removes the socket file.
pub(crate) struct Listener {
	address: String,
	path: Option<PathBuf>,
	task: AbortHandle,
}

impl Drop for Listener {
	fn drop(&mut self) {
		self.task.abort();
		if let Some(path) = &self.path {
			let _ = std::fs::remove_file(path);
		}
		tracing::debug!(address = %self.address, "embed.listen.stop");
	}
}

/// A fresh socket path under the user's runtime directory.
pub fn default_socket_path() -> PathBuf {
	static COUNTER: AtomicU64 = AtomicU64::new(0);
	let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
	let n = COUNTER.fetch_add(1, Ordering::Relaxed);
	dir.join(format!("xeno-embed.{}.{n}.sock", std::process::id()))
}

fn split_tcp(stream: TcpStream) -> (BoxedReader, BoxedWriter) {
	let (reader, writer) = stream.into_split();
	(Box::new(reader), Box::new(writer))
}

fn split_unix(stream: UnixStream) -> (BoxedReader, BoxedWriter) {
	let (reader, writer) = stream.into_split();
	(Box::new(reader), Box::new(writer))
}

/// Removes a socket file nobody is accepting on.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
	if !path.exists() {
		return Ok(());
	}
	if std::os::unix::net::UnixStream::connect(path).is_ok() {
		return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{} is in use", path.display())));
	}
	tracing::debug!(path = %path.display(), "embed.listen.stale_socket");
	std::fs::remove_file(path)
}

impl Scheduler {
	/// Listens on `address` and opens a channel per accepted connection.
	///
	/// Returns the bound address, with the actual port for TCP port 0.
	pub fn listen(&mut self, address: &str) -> Result<String> {
		let parsed = Address::parse(address, self.config.default_tcp_port)?;
		let queue = self.event_loop.fast_events().clone();
		let _guard = self.event_loop.enter();

		let (bound, path, task) = match parsed {
			Address::Tcp(addr) => {
				let std_listener = std::net::TcpListener::bind(addr.as_str())?;
				std_listener.set_nonblocking(true)?;
				let listener = TcpListener::from_std(std_listener)?;
				let bound = listener.local_addr()?.to_string();
				if self.listeners.iter().any(|l| l.address == bound) {
					return Err(Error::AlreadyListening(bound));
				}
				let task = self.event_loop.spawn(accept_tcp(listener, bound.clone(), queue));
				(bound, None, task.abort_handle())
			}
			Address::Unix(path) => {
				let bound = path.display().to_string();
				if self.listeners.iter().any(|l| l.address == bound) {
					return Err(Error::AlreadyListening(bound));
				}
				remove_stale_socket(&path)?;
				let listener = UnixListener::bind(&path)?;
				let task = self.event_loop.spawn(accept_unix(listener, bound.clone(), queue));
				(bound, Some(path), task.abort_handle())
			}
		};

		tracing::info!(address = %bound, "embed.listen");
		self.listeners.push(Listener {
			address: bound.clone(),
			path,
			task,
		});
		Ok(bound)
	}

	/// Stops the listener bound to `address`. Open channels stay open.
	pub fn stop_listening(&mut self, address: &str) -> bool {
		let before = self.listeners.len();
		self.listeners.retain(|l| l.address != address);
		self.listeners.len() != before
	}

	pub fn listen_addresses(&self) -> Vec<String> {
		self.listeners.iter().map(|l| l.address.clone()).collect()
	}

	/// Opens a channel to `address`. It stays `Connecting` until the
	/// connection completes and is closed if it fails.
	pub fn connect(&mut self, address: &str) -> Result<ChannelId> {
		let parsed = Address::parse(address, self.config.default_tcp_port)?;
		let id = self.create_channel(ChannelSource::Socket(address.to_owned()));
		let queue = self.event_loop.fast_events().clone();
		self.event_loop.spawn(async move {
			let outcome = match parsed {
				Address::Tcp(addr) => TcpStream::connect(addr).await.map(split_tcp),
				Address::Unix(path) => UnixStream::connect(path).await.map(split_unix),
			};
			queue.push(move |sched: &mut Scheduler| sched.finish_connect(id, outcome));
		});
		Ok(id)
	}

	fn finish_connect(&mut self, id: ChannelId, outcome: io::Result<(BoxedReader, BoxedWriter)>) {
		if self.channel_state(id) != Some(ChannelState::Connecting) {
			return;
		}
		match outcome {
			Ok((reader, writer)) => self.attach_streams(id, reader, writer),
			Err(err) => {
				self.teardown_channel(id, Some(format!("connect failed: {err}")));
			}
		}
	}

	fn accept_connection(&mut self, address: &str, reader: BoxedReader, writer: BoxedWriter) {
		let id = self.open_channel_with(ChannelSource::Socket(address.to_owned()), reader, writer);
		tracing::info!(channel = %id, address, "embed.accept");
	}

	/// Binds the process's own stdin and stdout to a channel.
	pub fn open_stdio(&mut self) -> Result<ChannelId> {
		if self.stdio_channel.is_some() {
			return Err(Error::StdioInUse);
		}
		let id = self.open_channel_with(ChannelSource::Stdio, Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()));
		self.stdio_channel = Some(id);
		Ok(id)
	}
}

async fn accept_tcp(listener: TcpListener, address: String, queue: MultiQueue<Scheduler>) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				tracing::debug!(address = %address, %peer, "embed.accept.tcp");
				let (reader, writer) = split_tcp(stream);
				let address = address.clone();
				if !queue.push(move |sched: &mut Scheduler| sched.accept_connection(&address, reader, writer)) {
					return;
				}
			}
			Err(err) => {
				tracing::error!(address = %address, error = %err, "embed.accept.failed");
				tokio::time::sleep(ACCEPT_BACKOFF).await;
			}
		}
	}
}

async fn accept_unix(listener: UnixListener, address: String, queue: MultiQueue<Scheduler>) {
	loop {
		match listener.accept().await {
			Ok((stream, _)) => {
				let (reader, writer) = split_unix(stream);
				let address = address.clone();
				if !queue.push(move |sched: &mut Scheduler| sched.accept_connection(&address, reader, writer)) {
					return;
				}
			}
			Err(err) => {
				tracing::error!(address = %address, error = %err, "embed.accept.failed");
				tokio::time::sleep(ACCEPT_BACKOFF).await;
			}
		}
	}
}
