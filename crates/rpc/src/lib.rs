//! Msgpack-RPC protocol layer.
//!
//! This crate is transport-agnostic; the embedding scheduler feeds it bytes
//! and hands it encoded output buffers:
//! * [`frame`]: non-allocating scanner that finds complete values in a stream
//! * [`codec`]: incremental [`Decoder`] and encoder over [`RpcMessage`]
//! * [`pending`]: id allocation and request/response correlation
//! * [`dispatch`]: method table, parameter schemas and handler invocation

pub mod client;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod pending;
pub mod protocol;

pub use client::{ClientInfo, ClientType};
pub use codec::{Decoder, encode_message, encode_value, to_bytes};
pub use dispatch::{Dispatcher, HandlerEntry, Method, ParamType, Route, Schema};
pub use error::{CallError, ErrorKind, ProtocolError, RemoteError, RpcError};
pub use frame::Limits;
pub use pending::{Lookup, PendingTable};
pub use protocol::{ChannelId, CounterIdGen, MessageType, RpcMessage, response_outcome};
pub use rmpv::Value;
