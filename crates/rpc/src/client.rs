//! Self-reported identity of the peer on a channel.

use std::fmt;

use rmpv::Value;

/// Peer category taken from the `type` key of the client info map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
	Remote,
	MsgpackRpc,
	Ui,
	Embedder,
	Host,
	Plugin,
	#[default]
	Unknown,
}

impl ClientType {
	pub fn parse(s: &str) -> Self {
		match s {
			"remote" => Self::Remote,
			"msgpack-rpc" => Self::MsgpackRpc,
			"ui" => Self::Ui,
			"embedder" => Self::Embedder,
			"host" => Self::Host,
			"plugin" => Self::Plugin,
			_ => Self::Unknown,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Remote => "remote",
			Self::MsgpackRpc => "msgpack-rpc",
			Self::Ui => "ui",
			Self::Embedder => "embedder",
			Self::Host => "host",
			Self::Plugin => "plugin",
			Self::Unknown => "unknown",
		}
	}
}

impl fmt::Display for ClientType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What a peer announced through `set_client_info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfo {
	pub name: Option<String>,
	pub kind: ClientType,
	/// The announced map, kept verbatim for introspection.
	pub raw: Vec<(Value, Value)>,
}

impl ClientInfo {
	pub fn from_map(map: Vec<(Value, Value)>) -> Self {
		let lookup = |key: &str| map.iter().find(|(k, _)| k.as_str() == Some(key)).and_then(|(_, v)| v.as_str());
		let name = lookup("name").map(str::to_owned);
		let kind = lookup("type").map(ClientType::parse).unwrap_or_default();
		Self { name, kind, raw: map }
	}

	pub fn to_value(&self) -> Value {
		Value::Map(self.raw.clone())
	}
}
