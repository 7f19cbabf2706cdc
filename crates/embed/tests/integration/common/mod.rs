//! Common utilities for embedding integration tests.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use xeno_embed::{ChannelId, EmbedConfig, Scheduler};
use xeno_rpc::{Decoder, Limits, RpcMessage, to_bytes};

/// Poll interval used while waiting on a peer.
pub const TICK: Duration = Duration::from_millis(5);

/// Generous upper bound for anything expected to happen.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn scheduler() -> Scheduler {
	scheduler_with(EmbedConfig::default())
}

pub fn scheduler_with(config: EmbedConfig) -> Scheduler {
	let _ = tracing_subscriber::fmt::try_init();
	Scheduler::new(config).expect("failed to build scheduler")
}

/// Shared recorder for callbacks that must be `Send + 'static`.
pub fn recorder<T>() -> Arc<Mutex<Vec<T>>> {
	Arc::new(Mutex::new(Vec::new()))
}

/// The remote end of a channel, driven synchronously from the test thread.
pub struct Peer {
	stream: UnixStream,
	decoder: Decoder,
	pub eof: bool,
}

/// Opens a channel over a socket pair and returns the far end.
pub fn open_peer(sched: &mut Scheduler) -> (ChannelId, Peer) {
	let (ours, theirs) = UnixStream::pair().expect("socketpair");
	ours.set_nonblocking(true).expect("nonblocking");
	theirs.set_nonblocking(true).expect("nonblocking");
	let (reader, writer) = {
		let _guard = sched.enter();
		tokio::net::UnixStream::from_std(ours).expect("register socket").into_split()
	};
	let id = sched.open_channel(reader, writer);
	(
		id,
		Peer {
			stream: theirs,
			decoder: Decoder::new(Limits::default()),
			eof: false,
		},
	)
}

impl Peer {
	pub fn send(&mut self, msg: RpcMessage) {
		let bytes = to_bytes(msg).expect("encode");
		self.send_raw(&bytes);
	}

	pub fn send_raw(&mut self, bytes: &[u8]) {
		let mut written = 0;
		while written < bytes.len() {
			match self.stream.write(&bytes[written..]) {
				Ok(n) => written += n,
				Err(err) if err.kind() == ErrorKind::WouldBlock => std::thread::sleep(TICK),
				Err(err) => panic!("peer write failed: {err}"),
			}
		}
	}

	fn fill(&mut self) {
		let mut buf = [0u8; 4096];
		loop {
			match self.stream.read(&mut buf) {
				Ok(0) => {
					self.eof = true;
					return;
				}
				Ok(n) => self.decoder.feed(&buf[..n]),
				Err(err) if err.kind() == ErrorKind::WouldBlock => return,
				Err(err) if err.kind() == ErrorKind::ConnectionReset => {
					self.eof = true;
					return;
				}
				Err(err) => panic!("peer read failed: {err}"),
			}
		}
	}

	/// Ticks the scheduler until a message arrives or `timeout` elapses.
	pub fn recv_within(&mut self, sched: &mut Scheduler, timeout: Duration) -> Option<RpcMessage> {
		let deadline = Instant::now() + timeout;
		loop {
			self.fill();
			if let Some(msg) = self.decoder.next_message().expect("peer decode") {
				return Some(msg);
			}
			if self.eof || Instant::now() >= deadline {
				return None;
			}
			sched.run_once(Some(TICK));
		}
	}

	pub fn recv(&mut self, sched: &mut Scheduler) -> RpcMessage {
		self.recv_within(sched, PATIENCE).expect("no message from scheduler")
	}

	/// Ticks for `window` and returns everything received meanwhile.
	pub fn drain_for(&mut self, sched: &mut Scheduler, window: Duration) -> Vec<RpcMessage> {
		let deadline = Instant::now() + window;
		let mut messages = Vec::new();
		while Instant::now() < deadline {
			sched.run_once(Some(TICK));
			self.fill();
			while let Some(msg) = self.decoder.next_message().expect("peer decode") {
				messages.push(msg);
			}
		}
		messages
	}

	/// Ticks until the scheduler closes its end.
	pub fn wait_eof(&mut self, sched: &mut Scheduler) -> bool {
		let deadline = Instant::now() + PATIENCE;
		while Instant::now() < deadline {
			self.fill();
			while self.decoder.next_message().ok().flatten().is_some() {}
			if self.eof {
				return true;
			}
			sched.run_once(Some(TICK));
		}
		false
	}
}
