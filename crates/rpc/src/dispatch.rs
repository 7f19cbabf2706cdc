//! Method table: name lookup, parameter validation and handler invocation.
//!
//! Handlers take the scheduler context `C`, the calling channel and the raw
//! params, and return a value or an [`RpcError`]. Whether a handler runs
//! inline or is deferred is decided by the caller from [`HandlerEntry::is_fast`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use rmpv::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::RpcError;
use crate::protocol::{ChannelId, RpcMessage};

/// Signature shared by every handler.
pub type HandlerFn<C> = dyn Fn(&mut C, ChannelId, Vec<Value>) -> Result<Value, RpcError> + Send + Sync;

/// Declared type of one parameter. Values are never coerced between types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
	Any,
	Nil,
	Bool,
	Integer,
	Float,
	String,
	Binary,
	Array,
	Map,
}

impl ParamType {
	pub fn matches(self, value: &Value) -> bool {
		match self {
			Self::Any => true,
			Self::Nil => value.is_nil(),
			Self::Bool => value.is_bool(),
			Self::Integer => matches!(value, Value::Integer(_)),
			Self::Float => matches!(value, Value::F32(_) | Value::F64(_)),
			Self::String => matches!(value, Value::String(_)),
			Self::Binary => matches!(value, Value::Binary(_)),
			Self::Array => matches!(value, Value::Array(_)),
			Self::Map => matches!(value, Value::Map(_)),
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Any => "Object",
			Self::Nil => "Nil",
			Self::Bool => "Boolean",
			Self::Integer => "Integer",
			Self::Float => "Float",
			Self::String => "String",
			Self::Binary => "Binary",
			Self::Array => "Array",
			Self::Map => "Dictionary",
		}
	}
}

/// Fixed leading parameters plus an optional variadic tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
	pub params: Vec<ParamType>,
	pub variadic: Option<ParamType>,
}

impl Schema {
	pub fn validate(&self, method: &str, args: &[Value]) -> Result<(), RpcError> {
		let arity_ok = match self.variadic {
			Some(_) => args.len() >= self.params.len(),
			None => args.len() == self.params.len(),
		};
		if !arity_ok {
			let expecting = match self.variadic {
				Some(_) => format!("at least {}", self.params.len()),
				None => self.params.len().to_string(),
			};
			return Err(RpcError::validation(format!("Wrong number of arguments: expecting {expecting} but got {}", args.len())));
		}

		let types = self.params.iter().copied().chain(std::iter::repeat(self.variadic.unwrap_or(ParamType::Any)));
		for (index, (arg, ty)) in args.iter().zip(types).enumerate() {
			if !ty.matches(arg) {
				return Err(RpcError::validation(format!(
					"Wrong type for argument {} when calling {method}, expecting {}",
					index + 1,
					ty.name()
				)));
			}
		}
		Ok(())
	}
}

/// Builder for a [`HandlerEntry`].
#[derive(Debug, Clone)]
pub struct Method {
	name: String,
	schema: Schema,
	fast: bool,
}

impl Method {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			schema: Schema::default(),
			fast: false,
		}
	}

	/// Declares the fixed parameters.
	pub fn params(mut self, params: impl IntoIterator<Item = ParamType>) -> Self {
		self.schema.params = params.into_iter().collect();
		self
	}

	/// Accepts any number of trailing arguments of type `ty`.
	pub fn variadic(mut self, ty: ParamType) -> Self {
		self.schema.variadic = Some(ty);
		self
	}

	/// Marks the handler safe to run inline from the I/O side.
	pub fn fast(mut self) -> Self {
		self.fast = true;
		self
	}

	pub fn handler<C, F>(self, f: F) -> HandlerEntry<C>
	where
		F: Fn(&mut C, ChannelId, Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
	{
		HandlerEntry {
			name: self.name,
			schema: self.schema,
			fast: self.fast,
			handler: Arc::new(f),
		}
	}
}

/// A registered method.
pub struct HandlerEntry<C> {
	name: String,
	schema: Schema,
	fast: bool,
	handler: Arc<HandlerFn<C>>,
}

impl<C> Clone for HandlerEntry<C> {
	fn clone(&self) -> Self {
		Self {
			name: self.name.clone(),
			schema: self.schema.clone(),
			fast: self.fast,
			handler: Arc::clone(&self.handler),
		}
	}
}

impl<C> fmt::Debug for HandlerEntry<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HandlerEntry")
			.field("name", &self.name)
			.field("schema", &self.schema)
			.field("fast", &self.fast)
			.finish_non_exhaustive()
	}
}

impl<C> HandlerEntry<C> {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn is_fast(&self) -> bool {
		self.fast
	}

	pub fn schema(&self) -> &Schema {
		&self.schema
	}

	/// Runs the handler. A panic is reported as an `Exception` error.
	pub fn invoke(&self, cx: &mut C, channel: ChannelId, params: Vec<Value>) -> Result<Value, RpcError> {
		match catch_unwind(AssertUnwindSafe(|| (self.handler)(cx, channel, params))) {
			Ok(outcome) => outcome,
			Err(payload) => {
				let message = panic_message(payload.as_ref());
				tracing::error!(method = %self.name, %channel, panic = %message, "rpc.handler.panic");
				Err(RpcError::exception(format!("{} panicked: {message}", self.name)))
			}
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(s) = payload.downcast_ref::<&'static str>() {
		s
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s
	} else {
		"non-string panic payload"
	}
}

/// What to do with an inbound request or notification.
#[derive(Debug)]
pub enum Route<C> {
	/// Run `entry` with `params`; reply to `request_id` when present.
	Invoke {
		entry: HandlerEntry<C>,
		request_id: Option<u64>,
		params: Vec<Value>,
	},
	/// Send this error response without running anything.
	Reject(RpcMessage),
	/// Unknown notification; nothing to do.
	Drop,
}

/// Name-keyed method table.
pub struct Dispatcher<C> {
	methods: HashMap<String, HandlerEntry<C>>,
}

impl<C> Default for Dispatcher<C> {
	fn default() -> Self {
		Self::new()
	}
}

impl<C> fmt::Debug for Dispatcher<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Dispatcher").field("methods", &self.method_names()).finish()
	}
}

impl<C> Dispatcher<C> {
	pub fn new() -> Self {
		Self { methods: HashMap::new() }
	}

	/// Registers `entry`, returning the entry it replaced.
	pub fn register(&mut self, entry: HandlerEntry<C>) -> Option<HandlerEntry<C>> {
		tracing::trace!(method = %entry.name, fast = entry.fast, "rpc.dispatch.register");
		self.methods.insert(entry.name.clone(), entry)
	}

	pub fn unregister(&mut self, name: &str) -> Option<HandlerEntry<C>> {
		self.methods.remove(name)
	}

	pub fn get(&self, name: &str) -> Option<&HandlerEntry<C>> {
		self.methods.get(name)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.methods.contains_key(name)
	}

	pub fn len(&self) -> usize {
		self.methods.len()
	}

	pub fn is_empty(&self) -> bool {
		self.methods.is_empty()
	}

	/// Registered method names, sorted.
	pub fn method_names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	/// Looks `method` up and validates `params` against its schema.
	pub fn resolve(&self, method: &str, params: &[Value]) -> Result<HandlerEntry<C>, RpcError> {
		let entry = self.methods.get(method).ok_or_else(|| RpcError::unknown_method(method))?;
		entry.schema.validate(method, params)?;
		Ok(entry.clone())
	}

	/// Decides how an inbound call is handled. `request_id` is `None` for
	/// notifications.
	pub fn route(&self, method: &str, request_id: Option<u64>, params: Vec<Value>) -> Route<C> {
		match (self.resolve(method, &params), request_id) {
			(Ok(entry), _) => Route::Invoke { entry, request_id, params },
			(Err(err), Some(id)) => Route::Reject(RpcMessage::response(id, Err(err))),
			(Err(err), None) if self.contains(method) => Route::Reject(error_event(&err)),
			(Err(_), None) => Route::Drop,
		}
	}
}

/// Name of the notification that reports failed notification handlers.
pub const ERROR_EVENT: &str = "error_event";

/// The notification sent to a peer whose notification could not be handled.
pub fn error_event(err: &RpcError) -> RpcMessage {
	RpcMessage::notification(ERROR_EVENT, vec![Value::from(err.kind.code()), Value::from(err.message.as_str())])
}

/// Deserializes parameter `index` into `T`.
pub fn from_param<T: DeserializeOwned>(params: &[Value], index: usize) -> Result<T, RpcError> {
	let value = params.get(index).cloned().unwrap_or(Value::Nil);
	rmpv::ext::from_value(value).map_err(|err| RpcError::validation(format!("Invalid argument {}: {err}", index + 1)))
}

/// Serializes a handler result.
pub fn to_result<T: Serialize>(value: T) -> Result<Value, RpcError> {
	rmpv::ext::to_value(value).map_err(|err| RpcError::exception(format!("Failed to encode result: {err}")))
}
