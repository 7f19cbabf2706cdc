//! Error taxonomy of the RPC layer.
//!
//! [`ProtocolError`] terminates the channel that produced it. [`RpcError`]
//! travels back to the peer as a `[code, message]` pair and leaves the channel
//! open. [`CallError`] is what the local side of an outbound request sees.

use rmpv::Value;

/// Error categories sent on the wire as the first element of `[code, message]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
	/// The handler failed while running.
	Exception = 0,
	/// Arguments did not match the declared parameter schema.
	Validation = 1,
	/// No handler is registered under the requested name.
	UnknownMethod = 2,
}

impl ErrorKind {
	pub fn code(self) -> i64 {
		self as i64
	}

	pub fn from_code(code: i64) -> Option<Self> {
		match code {
			0 => Some(Self::Exception),
			1 => Some(Self::Validation),
			2 => Some(Self::UnknownMethod),
			_ => None,
		}
	}
}

/// A dispatch failure reported to the peer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
	pub kind: ErrorKind,
	pub message: String,
}

impl RpcError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub fn exception(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Exception, message)
	}

	pub fn validation(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Validation, message)
	}

	pub fn unknown_method(method: &str) -> Self {
		Self::new(ErrorKind::UnknownMethod, format!("Invalid method: {method}"))
	}

	/// The `[code, message]` wire shape.
	pub fn to_value(&self) -> Value {
		Value::Array(vec![Value::from(self.kind.code()), Value::from(self.message.as_str())])
	}
}

/// An error value received from a peer, kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
	pub value: Value,
}

impl RemoteError {
	/// The numeric code when the peer used the `[code, message]` shape.
	pub fn code(&self) -> Option<i64> {
		self.value.as_array()?.first()?.as_i64()
	}

	/// The message when the peer used the `[code, message]` shape, or the
	/// value itself when it is a bare string.
	pub fn message(&self) -> Option<&str> {
		match &self.value {
			Value::Array(items) => items.get(1)?.as_str(),
			other => other.as_str(),
		}
	}
}

impl std::fmt::Display for RemoteError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.message() {
			Some(message) => f.write_str(message),
			None => write!(f, "{}", self.value),
		}
	}
}

/// Violations of the wire protocol. Each one closes the offending channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
	#[error("reserved msgpack marker 0xc1")]
	ReservedMarker,
	#[error("message exceeds the {limit} byte limit")]
	TooLarge { limit: usize },
	#[error("message nesting exceeds depth {limit}")]
	TooDeep { limit: usize },
	#[error("malformed msgpack: {0}")]
	Decode(String),
	#[error("failed to encode message: {0}")]
	Encode(String),
	#[error("invalid message: {0}")]
	InvalidMessage(&'static str),
	#[error("received response for unknown request id {0}")]
	UnexpectedResponse(u64),
}

/// Why an outbound request did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CallError {
	/// The peer answered with an error value.
	#[error("remote error: {0}")]
	Remote(RemoteError),
	/// The channel closed before the response arrived.
	#[error("channel {0} closed")]
	Disconnected(u64),
	#[error("request timed out")]
	TimedOut,
	#[error("invalid channel: {0}")]
	InvalidChannel(u64),
	/// The channel is not in the `Established` state.
	#[error("channel {0} is not established")]
	NotEstablished(u64),
	/// The channel's write queue is over its bound.
	#[error("channel {channel} has {pending} bytes queued; refusing to send")]
	Backpressure { channel: u64, pending: usize },
	#[error("request id space exhausted")]
	IdSpaceExhausted,
	#[error(transparent)]
	Protocol(#[from] ProtocolError),
}
