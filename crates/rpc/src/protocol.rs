//! The three msgpack-rpc message shapes and their value representation.

use rmpv::Value;

use crate::error::{ProtocolError, RemoteError, RpcError};

/// Discriminator stored in the first element of every message array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
	Request = 0,
	Response = 1,
	Notification = 2,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
	/// `[0, id, method, params]`
	Request { id: u64, method: String, params: Vec<Value> },
	/// `[1, id, error, result]`
	Response { id: u64, error: Option<Value>, result: Value },
	/// `[2, method, params]`
	Notification { method: String, params: Vec<Value> },
}

impl RpcMessage {
	pub fn request(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
		Self::Request {
			id,
			method: method.into(),
			params,
		}
	}

	pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
		Self::Notification {
			method: method.into(),
			params,
		}
	}

	/// Builds the response to request `id` from a handler outcome.
	pub fn response(id: u64, outcome: Result<Value, RpcError>) -> Self {
		match outcome {
			Ok(result) => Self::Response { id, error: None, result },
			Err(err) => Self::Response {
				id,
				error: Some(err.to_value()),
				result: Value::Nil,
			},
		}
	}

	pub fn kind(&self) -> MessageType {
		match self {
			Self::Request { .. } => MessageType::Request,
			Self::Response { .. } => MessageType::Response,
			Self::Notification { .. } => MessageType::Notification,
		}
	}

	pub fn method(&self) -> Option<&str> {
		match self {
			Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
			Self::Response { .. } => None,
		}
	}

	/// Validates the structure of a decoded top-level value.
	pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
		let Value::Array(items) = value else {
			return Err(ProtocolError::InvalidMessage("message is not an array"));
		};
		let mut items = items.into_iter();
		let kind = items.next().and_then(|v| v.as_u64()).ok_or(ProtocolError::InvalidMessage("missing message type"))?;

		match (kind, items.len()) {
			(0, 3) => {
				let id = take_id(&mut items)?;
				let method = take_method(&mut items)?;
				let params = take_params(&mut items)?;
				Ok(Self::Request { id, method, params })
			}
			(1, 3) => {
				let id = take_id(&mut items)?;
				let error = items.next().filter(|v| !v.is_nil());
				let result = items.next().unwrap_or(Value::Nil);
				Ok(Self::Response { id, error, result })
			}
			(2, 2) => {
				let method = take_method(&mut items)?;
				let params = take_params(&mut items)?;
				Ok(Self::Notification { method, params })
			}
			(0..=2, _) => Err(ProtocolError::InvalidMessage("wrong number of message elements")),
			_ => Err(ProtocolError::InvalidMessage("unknown message type")),
		}
	}

	pub fn into_value(self) -> Value {
		match self {
			Self::Request { id, method, params } => Value::Array(vec![
				Value::from(MessageType::Request as u8),
				Value::from(id),
				Value::from(method),
				Value::Array(params),
			]),
			Self::Response { id, error, result } => Value::Array(vec![
				Value::from(MessageType::Response as u8),
				Value::from(id),
				error.unwrap_or(Value::Nil),
				result,
			]),
			Self::Notification { method, params } => {
				Value::Array(vec![Value::from(MessageType::Notification as u8), Value::from(method), Value::Array(params)])
			}
		}
	}
}

/// Splits a response into the continuation's view of it.
pub fn response_outcome(error: Option<Value>, result: Value) -> Result<Value, RemoteError> {
	match error {
		Some(value) => Err(RemoteError { value }),
		None => Ok(result),
	}
}

fn take_id(items: &mut impl Iterator<Item = Value>) -> Result<u64, ProtocolError> {
	items.next().and_then(|v| v.as_u64()).ok_or(ProtocolError::InvalidMessage("request id is not an unsigned integer"))
}

fn take_method(items: &mut impl Iterator<Item = Value>) -> Result<String, ProtocolError> {
	match items.next() {
		Some(Value::String(s)) => s.into_str().ok_or(ProtocolError::InvalidMessage("method name is not valid UTF-8")),
		_ => Err(ProtocolError::InvalidMessage("method name is not a string")),
	}
}

fn take_params(items: &mut impl Iterator<Item = Value>) -> Result<Vec<Value>, ProtocolError> {
	match items.next() {
		Some(Value::Array(params)) => Ok(params),
		_ => Err(ProtocolError::InvalidMessage("params are not an array")),
	}
}

/// Identity of one RPC peer, unique for the lifetime of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "ch {}", self.0)
	}
}

/// Monotonic per-channel request id counter.
///
/// Starts at 1 and wraps past `u64::MAX` back to 1; callers skip ids that are
/// still in flight.
#[derive(Debug, Clone, Copy)]
pub struct CounterIdGen(u64);

impl Default for CounterIdGen {
	fn default() -> Self {
		Self::new()
	}
}

impl CounterIdGen {
	#[must_use]
	pub const fn new() -> Self {
		Self(1)
	}

	#[allow(clippy::should_implement_trait, reason = "convention")]
	pub fn next(&mut self) -> u64 {
		let id = self.0;
		self.0 = self.0.checked_add(1).unwrap_or(1);
		id
	}

	#[cfg(test)]
	pub(crate) const fn starting_at(id: u64) -> Self {
		Self(id)
	}
}
