//! Incremental message decoder and the matching encoder.

use std::fmt::Display;
use std::io::Write;

use bytes::{Buf, BytesMut};
use rmpv::Value;
use xeno_event::GrowBuf;

use crate::error::ProtocolError;
use crate::frame::{Limits, Scan, Scanner};
use crate::protocol::RpcMessage;

/// Accumulates stream bytes and yields complete messages.
///
/// An incomplete trailing value stays buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct Decoder {
	buf: BytesMut,
	limits: Limits,
	scanner: Scanner,
}

impl Decoder {
	pub fn new(limits: Limits) -> Self {
		Self {
			buf: BytesMut::new(),
			limits,
			scanner: Scanner::default(),
		}
	}

	pub fn feed(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Bytes received but not yet decoded.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Decodes the next complete value, if one is buffered.
	pub fn next_value(&mut self) -> Result<Option<Value>, ProtocolError> {
		let len = match self.scanner.scan(&self.buf, &self.limits)? {
			Scan::Complete(len) => len,
			Scan::Incomplete => return Ok(None),
		};
		let mut frame = &self.buf[..len];
		let value = rmpv::decode::read_value(&mut frame).map_err(|err| ProtocolError::Decode(err.to_string()))?;
		self.buf.advance(len);
		self.scanner.reset();
		Ok(Some(value))
	}

	/// Decodes the next complete message, if one is buffered.
	pub fn next_message(&mut self) -> Result<Option<RpcMessage>, ProtocolError> {
		self.next_value()?.map(RpcMessage::from_value).transpose()
	}
}

/// Encodes `value`, writing strings as msgpack `str` with their raw bytes
/// even when they are not valid UTF-8.
pub fn encode_value(value: &Value, out: &mut GrowBuf) -> Result<(), ProtocolError> {
	match value {
		Value::String(s) => {
			let bytes = s.as_bytes();
			rmp::encode::write_str_len(out, wire_len(bytes.len())?).map_err(encode_error)?;
			out.write_all(bytes).map_err(encode_error)
		}
		Value::Array(items) => {
			rmp::encode::write_array_len(out, wire_len(items.len())?).map_err(encode_error)?;
			items.iter().try_for_each(|item| encode_value(item, out))
		}
		Value::Map(entries) => {
			rmp::encode::write_map_len(out, wire_len(entries.len())?).map_err(encode_error)?;
			entries.iter().try_for_each(|(key, value)| {
				encode_value(key, out)?;
				encode_value(value, out)
			})
		}
		scalar => rmpv::encode::write_value(out, scalar).map_err(encode_error),
	}
}

fn wire_len(len: usize) -> Result<u32, ProtocolError> {
	u32::try_from(len).map_err(|_| ProtocolError::Encode(format!("length {len} does not fit a msgpack header")))
}

fn encode_error(err: impl Display) -> ProtocolError {
	ProtocolError::Encode(err.to_string())
}

pub fn encode_message(msg: RpcMessage, out: &mut GrowBuf) -> Result<(), ProtocolError> {
	encode_value(&msg.into_value(), out)
}

/// Encodes `msg` into a fresh buffer.
pub fn to_bytes(msg: RpcMessage) -> Result<bytes::Bytes, ProtocolError> {
	let mut out = GrowBuf::new();
	encode_message(msg, &mut out)?;
	Ok(out.freeze())
}
