//! RPC channels: one peer, its streams, and its in-flight requests.
//!
//! Each channel owns two child queues of the main queue. `rpc_queue` holds
//! deferred handler invocations and is cancelled wholesale when the channel
//! starts closing. `call_queue` holds request continuations, timeouts and the
//! final close step, so a continuation queued before teardown still runs
//! exactly once. Stream notices go through `io_queue`, a child of the
//! I/O-side queue.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use xeno_event::{GrowBuf, MultiQueue, ReadNotice, ReadStream, TimerHandle, WriteNotice, WriteStream};
use xeno_rpc::dispatch::error_event;
use xeno_rpc::{CallError, ChannelId, ClientInfo, Decoder, HandlerEntry, Lookup, PendingTable, ProtocolError, Route, RpcError, RpcMessage, Value, response_outcome};

use crate::job::JobId;
use crate::scheduler::Scheduler;

/// Receives the outcome of an outbound request, exactly once.
pub type Continuation = Box<dyn FnOnce(&mut Scheduler, Result<Value, CallError>) + Send>;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
	/// Waiting for an outgoing connection to complete.
	Connecting,
	/// Dispatching and sending.
	Established,
	/// Pending requests failed; queued writes draining.
	Closing,
	/// Released.
	Closed,
}

/// What a channel's streams are attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSource {
	Stdio,
	/// Accepted from, or connected to, this address.
	Socket(String),
	Job(JobId),
	/// Arbitrary streams handed in by the host.
	Internal,
}

impl ChannelSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Stdio => "stdio",
			Self::Socket(_) => "socket",
			Self::Job(_) => "job",
			Self::Internal => "internal",
		}
	}
}

/// Introspection snapshot of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
	pub id: ChannelId,
	pub state: ChannelState,
	pub source: ChannelSource,
	pub client: ClientInfo,
	pub pending_requests: usize,
	pub subscriptions: Vec<String>,
}

impl ChannelInfo {
	pub fn to_value(&self) -> Value {
		let mut map = vec![
			(Value::from("id"), Value::from(self.id.0)),
			(Value::from("stream"), Value::from(self.source.as_str())),
			(Value::from("mode"), Value::from("rpc")),
		];
		if let ChannelSource::Job(job) = &self.source {
			map.push((Value::from("job"), Value::from(job.0)));
		}
		if let ChannelSource::Socket(addr) = &self.source {
			map.push((Value::from("address"), Value::from(addr.as_str())));
		}
		if !self.client.raw.is_empty() {
			map.push((Value::from("client"), self.client.to_value()));
		}
		Value::Map(map)
	}
}

pub(crate) struct PendingCall {
	method: String,
	continuation: Continuation,
	timer: Option<TimerHandle>,
}

pub(crate) struct Channel {
	pub(crate) id: ChannelId,
	pub(crate) state: ChannelState,
	pub(crate) source: ChannelSource,
	reader: Option<ReadStream>,
	writer: Option<WriteStream>,
	decoder: Decoder,
	pending: PendingTable<PendingCall>,
	pub(crate) subscriptions: HashSet<String>,
	pub(crate) client: ClientInfo,
	io_queue: MultiQueue<Scheduler>,
	pub(crate) rpc_queue: MultiQueue<Scheduler>,
	pub(crate) call_queue: MultiQueue<Scheduler>,
}

impl fmt::Debug for Channel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Channel")
			.field("id", &self.id)
			.field("state", &self.state)
			.field("source", &self.source)
			.field("pending", &self.pending.len())
			.finish_non_exhaustive()
	}
}

impl Channel {
	fn info(&self) -> ChannelInfo {
		let mut subscriptions: Vec<String> = self.subscriptions.iter().cloned().collect();
		subscriptions.sort_unstable();
		ChannelInfo {
			id: self.id,
			state: self.state,
			source: self.source.clone(),
			client: self.client.clone(),
			pending_requests: self.pending.len(),
			subscriptions,
		}
	}
}

/// Live channels keyed by id. Ids start at 1 and are never reused.
#[derive(Debug)]
pub(crate) struct ChannelTable {
	channels: HashMap<ChannelId, Channel>,
	next_id: u64,
	/// Outcomes of `request_blocking` calls, keyed by call sequence.
	blocking: HashMap<u64, Result<Value, CallError>>,
	blocking_seq: u64,
}

impl Default for ChannelTable {
	fn default() -> Self {
		Self {
			channels: HashMap::new(),
			next_id: 1,
			blocking: HashMap::new(),
			blocking_seq: 0,
		}
	}
}

impl ChannelTable {
	pub(crate) fn len(&self) -> usize {
		self.channels.len()
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.channels.is_empty()
	}

	pub(crate) fn get(&self, id: ChannelId) -> Option<&Channel> {
		self.channels.get(&id)
	}

	pub(crate) fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
		self.channels.get_mut(&id)
	}

	fn allocate(&mut self) -> ChannelId {
		let id = ChannelId(self.next_id);
		self.next_id += 1;
		id
	}

	fn blocking_slot(&mut self) -> u64 {
		self.blocking_seq += 1;
		self.blocking_seq
	}
}

impl Scheduler {
	/// Creates a channel over arbitrary async streams.
	pub fn open_channel<R, W>(&mut self, reader: R, writer: W) -> ChannelId
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		self.open_channel_with(ChannelSource::Internal, Box::new(reader), Box::new(writer))
	}

	pub(crate) fn open_channel_with(&mut self, source: ChannelSource, reader: BoxedReader, writer: BoxedWriter) -> ChannelId {
		let id = self.create_channel(source);
		self.attach_streams(id, reader, writer);
		id
	}

	/// Registers a channel in `Connecting` state without streams.
	pub(crate) fn create_channel(&mut self, source: ChannelSource) -> ChannelId {
		let id = self.channels.allocate();
		let channel = Channel {
			id,
			state: ChannelState::Connecting,
			source,
			reader: None,
			writer: None,
			decoder: Decoder::new(self.config.limits()),
			pending: PendingTable::new(),
			subscriptions: HashSet::new(),
			client: ClientInfo::default(),
			io_queue: self.event_loop.fast_events().child(),
			rpc_queue: self.event_loop.events().child(),
			call_queue: self.event_loop.events().child(),
		};
		tracing::debug!(channel = %id, source = channel.source.as_str(), "rpc.channel.create");
		self.channels.channels.insert(id, channel);
		id
	}

	/// Starts the pumps and moves the channel to `Established`.
	pub(crate) fn attach_streams(&mut self, id: ChannelId, reader: BoxedReader, writer: BoxedWriter) {
		let handle = self.event_loop.handle();
		let capacity = self.config.channel_buffer_size;
		let Some(channel) = self.channels.get_mut(id) else {
			return;
		};
		if channel.state != ChannelState::Connecting {
			return;
		}
		channel.reader = Some(ReadStream::spawn(&handle, reader, capacity, channel.io_queue.clone(), move |sched: &mut Scheduler, notice| {
			sched.on_channel_read(id, notice);
		}));
		channel.writer = Some(WriteStream::spawn(&handle, writer, channel.io_queue.clone(), move |sched: &mut Scheduler, notice| {
			sched.on_channel_write(id, notice);
		}));
		channel.state = ChannelState::Established;
		tracing::info!(channel = %id, source = channel.source.as_str(), "rpc.channel.established");
	}

	pub fn channel_ids(&self) -> Vec<ChannelId> {
		let mut ids: Vec<ChannelId> = self.channels.channels.keys().copied().collect();
		ids.sort_unstable();
		ids
	}

	pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
		self.channels.get(id).map(|channel| channel.state)
	}

	pub fn channel_info(&self, id: ChannelId) -> Option<ChannelInfo> {
		self.channels.get(id).map(Channel::info)
	}

	pub fn set_client_info(&mut self, id: ChannelId, info: ClientInfo) -> bool {
		let Some(channel) = self.channels.get_mut(id) else {
			return false;
		};
		tracing::debug!(channel = %id, name = ?info.name, kind = %info.kind, "rpc.channel.client_info");
		channel.client = info;
		true
	}

	pub fn subscribe(&mut self, id: ChannelId, event: impl Into<String>) -> bool {
		self.channels.get_mut(id).is_some_and(|channel| {
			channel.subscriptions.insert(event.into());
			true
		})
	}

	pub fn unsubscribe(&mut self, id: ChannelId, event: &str) -> bool {
		self.channels.get_mut(id).is_some_and(|channel| channel.subscriptions.remove(event))
	}

	/// Sends a request using the configured default timeout.
	pub fn send_request(
		&mut self,
		id: ChannelId,
		method: impl Into<String>,
		params: Vec<Value>,
		continuation: impl FnOnce(&mut Scheduler, Result<Value, CallError>) + Send + 'static,
	) -> Result<u64, CallError> {
		let timeout = self.config.request_timeout_duration();
		self.send_request_with_timeout(id, method, params, timeout, continuation)
	}

	/// Sends a request; `continuation` runs on the tick with the response,
	/// a timeout, or a disconnect.
	///
	/// On `Err` nothing was sent and `continuation` is dropped unrun.
	pub fn send_request_with_timeout(
		&mut self,
		id: ChannelId,
		method: impl Into<String>,
		params: Vec<Value>,
		timeout: Option<Duration>,
		continuation: impl FnOnce(&mut Scheduler, Result<Value, CallError>) + Send + 'static,
	) -> Result<u64, CallError> {
		let method = method.into();
		self.check_writable(id)?;
		let Some(channel) = self.channels.get_mut(id) else {
			return Err(CallError::InvalidChannel(id.0));
		};
		let request_id = channel.pending.insert(PendingCall {
			method: method.clone(),
			continuation: Box::new(continuation),
			timer: None,
		})?;

		if let Err(err) = self.write_message(id, RpcMessage::request(request_id, method.as_str(), params)) {
			if let Some(channel) = self.channels.get_mut(id) {
				channel.pending.complete(request_id);
			}
			return Err(err);
		}

		if let Some(timeout) = timeout
			&& let Some(channel) = self.channels.get(id)
		{
			let timer = self.event_loop.timer(timeout, &channel.call_queue, move |sched: &mut Scheduler| {
				sched.time_out_request(id, request_id);
			});
			if let Some(call) = self.channels.get_mut(id).and_then(|channel| channel.pending.get_mut(request_id)) {
				call.timer = Some(timer);
			}
		}

		tracing::debug!(channel = %id, request = request_id, method = %method, "rpc.request.send");
		Ok(request_id)
	}

	/// Sends a request and ticks, focused on this channel, until it resolves.
	///
	/// Other sources' deferred events stay queued meanwhile; this channel's
	/// own deferred requests are still served so the peer can call back.
	pub fn request_blocking(&mut self, id: ChannelId, method: impl Into<String>, params: Vec<Value>, timeout: Option<Duration>) -> Result<Value, CallError> {
		let slot = self.channels.blocking_slot();
		self.send_request_with_timeout(id, method, params, timeout, move |sched: &mut Scheduler, outcome| {
			sched.channels.blocking.insert(slot, outcome);
		})?;

		let queues = match self.channels.get(id) {
			Some(channel) => vec![channel.call_queue.clone(), channel.rpc_queue.clone()],
			None => Vec::new(),
		};
		self.run_focused(&queues, None, |sched| sched.channels.blocking.contains_key(&slot) || sched.channels.get(id).is_none());
		self.channels.blocking.remove(&slot).unwrap_or(Err(CallError::Disconnected(id.0)))
	}

	/// Sends a notification. Fire-and-forget: no id, no acknowledgment.
	pub fn send_notification(&mut self, id: ChannelId, method: impl Into<String>, params: Vec<Value>) -> Result<(), CallError> {
		self.check_writable(id)?;
		self.write_message(id, RpcMessage::notification(method, params))
	}

	/// Notifies every established channel subscribed to `event`. Returns how
	/// many channels were written to.
	pub fn broadcast(&mut self, event: &str, params: Vec<Value>) -> usize {
		let targets: Vec<ChannelId> = self
			.channels
			.channels
			.values()
			.filter(|channel| channel.state == ChannelState::Established && channel.subscriptions.contains(event))
			.map(|channel| channel.id)
			.collect();
		targets
			.into_iter()
			.filter(|&id| self.send_notification(id, event, params.clone()).is_ok())
			.count()
	}

	/// Starts closing a channel. Returns `false` if it is unknown or already closing.
	pub fn close_channel(&mut self, id: ChannelId) -> bool {
		self.teardown_channel(id, None)
	}

	fn check_writable(&self, id: ChannelId) -> Result<(), CallError> {
		let channel = self.channels.get(id).ok_or(CallError::InvalidChannel(id.0))?;
		if channel.state != ChannelState::Established {
			return Err(CallError::NotEstablished(id.0));
		}
		let pending = channel.writer.as_ref().map_or(0, WriteStream::pending_bytes);
		if pending > self.config.max_pending_write_bytes {
			tracing::warn!(channel = %id, pending, "rpc.channel.backpressure");
			return Err(CallError::Backpressure { channel: id.0, pending });
		}
		Ok(())
	}

	/// Encodes and queues one message.
	///
	/// A failed pump reports itself through [`WriteNotice::Error`], which
	/// tears the channel down; this only reports the refusal.
	fn write_message(&self, id: ChannelId, msg: RpcMessage) -> Result<(), CallError> {
		let mut buf = GrowBuf::new();
		xeno_rpc::encode_message(msg, &mut buf)?;
		let channel = self.channels.get(id).ok_or(CallError::InvalidChannel(id.0))?;
		let Some(writer) = &channel.writer else {
			return Err(CallError::NotEstablished(id.0));
		};
		writer.write(buf.freeze()).map_err(|err| {
			tracing::debug!(channel = %id, error = %err, "rpc.channel.write_refused");
			CallError::Disconnected(id.0)
		})
	}

	fn on_channel_read(&mut self, id: ChannelId, notice: ReadNotice) {
		let Some(channel) = self.channels.get_mut(id) else {
			return;
		};
		if channel.state != ChannelState::Established {
			return;
		}

		let end = match notice {
			ReadNotice::Data => None,
			ReadNotice::Eof => Some(None),
			ReadNotice::Error(err) => Some(Some(format!("stream read failed: {err}"))),
		};

		let mut bytes = Vec::new();
		if let Some(reader) = &channel.reader {
			reader.drain_into(&mut bytes);
		}
		channel.decoder.feed(&bytes);

		let mut messages = Vec::new();
		let failure = loop {
			match channel.decoder.next_message() {
				Ok(Some(msg)) => messages.push(msg),
				Ok(None) => break None,
				Err(err) => break Some(err),
			}
		};
		let trailing = channel.decoder.buffered();

		for msg in messages {
			self.handle_message(id, msg);
		}

		if let Some(err) = failure {
			self.protocol_error(id, &err);
		} else if let Some(reason) = end {
			if trailing > 0 {
				tracing::warn!(channel = %id, bytes = trailing, "rpc.channel.truncated");
			}
			self.teardown_channel(id, reason);
		}
	}

	fn on_channel_write(&mut self, id: ChannelId, notice: WriteNotice) {
		match notice {
			WriteNotice::Error(err) => {
				self.teardown_channel(id, Some(format!("stream write failed: {err}")));
			}
			WriteNotice::Closed => tracing::trace!(channel = %id, "rpc.channel.write_closed"),
		}
	}

	fn protocol_error(&mut self, id: ChannelId, err: &ProtocolError) {
		tracing::error!(channel = %id, error = %err, "rpc.protocol.error");
		self.teardown_channel(id, Some(format!("protocol error: {err}")));
	}

	fn handle_message(&mut self, id: ChannelId, msg: RpcMessage) {
		if self.channel_state(id) != Some(ChannelState::Established) {
			return;
		}
		match msg {
			RpcMessage::Request { id: request_id, method, params } => {
				tracing::debug!(channel = %id, request = request_id, method = %method, "rpc.request.recv");
				self.route_call(id, &method, Some(request_id), params);
			}
			RpcMessage::Notification { method, params } => {
				tracing::debug!(channel = %id, method = %method, "rpc.notification.recv");
				self.route_call(id, &method, None, params);
			}
			RpcMessage::Response { id: request_id, error, result } => self.handle_response(id, request_id, error, result),
		}
	}

	fn route_call(&mut self, id: ChannelId, method: &str, request_id: Option<u64>, params: Vec<Value>) {
		match self.dispatcher.route(method, request_id, params) {
			Route::Invoke { entry, request_id, params } if entry.is_fast() => {
				let outcome = entry.invoke(self, id, params);
				self.reply(id, request_id, outcome);
			}
			Route::Invoke { entry, request_id, params } => {
				if let Some(channel) = self.channels.get(id) {
					channel.rpc_queue.push(move |sched: &mut Scheduler| sched.run_deferred(id, &entry, request_id, params));
				}
			}
			Route::Reject(reply) => {
				tracing::debug!(channel = %id, method, "rpc.dispatch.reject");
				if let Err(err) = self.write_message(id, reply) {
					tracing::debug!(channel = %id, error = %err, "rpc.reply.dropped");
				}
			}
			Route::Drop => tracing::debug!(channel = %id, method, "rpc.notification.unknown"),
		}
	}

	fn run_deferred(&mut self, id: ChannelId, entry: &HandlerEntry<Scheduler>, request_id: Option<u64>, params: Vec<Value>) {
		if self.channel_state(id) != Some(ChannelState::Established) {
			return;
		}
		let outcome = entry.invoke(self, id, params);
		self.reply(id, request_id, outcome);
	}

	fn reply(&mut self, id: ChannelId, request_id: Option<u64>, outcome: Result<Value, RpcError>) {
		let msg = match (request_id, outcome) {
			(Some(request_id), outcome) => RpcMessage::response(request_id, outcome),
			(None, Err(err)) => {
				tracing::debug!(channel = %id, error = %err, "rpc.notification.failed");
				error_event(&err)
			}
			(None, Ok(_)) => return,
		};
		if let Err(err) = self.write_message(id, msg) {
			tracing::debug!(channel = %id, error = %err, "rpc.reply.dropped");
		}
	}

	fn handle_response(&mut self, id: ChannelId, request_id: u64, error: Option<Value>, result: Value) {
		let Some(channel) = self.channels.get_mut(id) else {
			return;
		};
		match channel.pending.complete(request_id) {
			Lookup::Pending(call) => {
				if let Some(timer) = &call.timer {
					timer.cancel();
				}
				tracing::debug!(channel = %id, request = request_id, method = %call.method, error = error.is_some(), "rpc.response.recv");
				let outcome = response_outcome(error, result).map_err(CallError::Remote);
				let continuation = call.continuation;
				channel.call_queue.push(move |sched: &mut Scheduler| continuation(sched, outcome));
			}
			Lookup::TimedOut => {
				tracing::warn!(channel = %id, request = request_id, "rpc.response.late");
			}
			Lookup::Unknown => self.protocol_error(id, &ProtocolError::UnexpectedResponse(request_id)),
		}
	}

	fn time_out_request(&mut self, id: ChannelId, request_id: u64) {
		let Some(call) = self.channels.get_mut(id).and_then(|channel| channel.pending.time_out(request_id)) else {
			return;
		};
		tracing::warn!(channel = %id, request = request_id, method = %call.method, "rpc.request.timeout");
		(call.continuation)(self, Err(CallError::TimedOut));
	}

	/// Moves the channel to `Closing`: cancels deferred handlers, fails every
	/// pending request, flushes queued writes, and queues the final release
	/// behind every event already queued for the channel.
	pub(crate) fn teardown_channel(&mut self, id: ChannelId, error: Option<String>) -> bool {
		let Some(channel) = self.channels.get_mut(id) else {
			return false;
		};
		if matches!(channel.state, ChannelState::Closing | ChannelState::Closed) {
			return false;
		}
		match &error {
			Some(error) => tracing::error!(channel = %id, error = %error, "rpc.channel.close"),
			None => tracing::info!(channel = %id, "rpc.channel.close"),
		}
		channel.state = ChannelState::Closing;
		channel.rpc_queue.close();
		channel.io_queue.close();

		let pending = channel.pending.drain();
		for (request_id, call) in pending {
			if let Some(timer) = &call.timer {
				timer.cancel();
			}
			tracing::debug!(channel = %id, request = request_id, method = %call.method, "rpc.request.disconnected");
			let continuation = call.continuation;
			channel.call_queue.push(move |sched: &mut Scheduler| continuation(sched, Err(CallError::Disconnected(id.0))));
		}

		if let Some(writer) = channel.writer.as_mut() {
			writer.close();
		}
		let finalize = move |sched: &mut Scheduler| sched.finalize_channel(id);
		match channel.reader.as_mut() {
			Some(reader) => reader.close(&channel.call_queue, finalize),
			None => {
				channel.call_queue.push(finalize);
			}
		}
		true
	}

	fn finalize_channel(&mut self, id: ChannelId) {
		let Some(mut channel) = self.channels.channels.remove(&id) else {
			return;
		};
		channel.state = ChannelState::Closed;
		channel.call_queue.close();
		if self.stdio_channel == Some(id) {
			self.stdio_channel = None;
		}
		if let ChannelSource::Job(job) = channel.source {
			self.jobs.detach_channel(job, id);
		}
		tracing::debug!(channel = %id, "rpc.channel.closed");
		drop(channel);

		let mut hooks = std::mem::take(&mut self.close_hooks);
		for hook in &mut hooks {
			hook(self, id);
		}
		hooks.append(&mut self.close_hooks);
		self.close_hooks = hooks;
	}
}
