//! Built-in introspection handlers every host can register.

use xeno_rpc::dispatch::from_param;
use xeno_rpc::{ChannelId, ClientInfo, Method, ParamType, RpcError, Value};

use crate::scheduler::Scheduler;

/// Registers `get_api_info`, `get_chan_info`, `list_chans`,
/// `set_client_info`, `subscribe` and `unsubscribe`. All of them are fast.
pub fn register_builtins(sched: &mut Scheduler) {
	sched.register(Method::new("get_api_info").fast().handler(get_api_info));
	sched.register(Method::new("get_chan_info").params([ParamType::Integer]).fast().handler(get_chan_info));
	sched.register(Method::new("list_chans").fast().handler(list_chans));
	sched.register(
		Method::new("set_client_info")
			.params([ParamType::String, ParamType::Map, ParamType::String, ParamType::Map, ParamType::Map])
			.fast()
			.handler(set_client_info),
	);
	sched.register(Method::new("subscribe").params([ParamType::String]).fast().handler(subscribe));
	sched.register(Method::new("unsubscribe").params([ParamType::String]).fast().handler(unsubscribe));
}

fn get_api_info(sched: &mut Scheduler, channel: ChannelId, _: Vec<Value>) -> Result<Value, RpcError> {
	let methods = sched.dispatcher().method_names().into_iter().map(Value::from).collect();
	let info = Value::Map(vec![(Value::from("methods"), Value::Array(methods))]);
	Ok(Value::Array(vec![Value::from(channel.0), info]))
}

/// Id 0 means the calling channel. Unknown ids yield an empty map.
fn get_chan_info(sched: &mut Scheduler, channel: ChannelId, params: Vec<Value>) -> Result<Value, RpcError> {
	let id: u64 = from_param(&params, 0)?;
	let id = if id == 0 { channel } else { ChannelId(id) };
	Ok(sched.channel_info(id).map_or_else(|| Value::Map(Vec::new()), |info| info.to_value()))
}

fn list_chans(sched: &mut Scheduler, _: ChannelId, _: Vec<Value>) -> Result<Value, RpcError> {
	let chans = sched
		.channel_ids()
		.into_iter()
		.filter_map(|id| sched.channel_info(id))
		.map(|info| info.to_value())
		.collect();
	Ok(Value::Array(chans))
}

fn set_client_info(sched: &mut Scheduler, channel: ChannelId, params: Vec<Value>) -> Result<Value, RpcError> {
	let keys = ["name", "version", "type", "methods", "attributes"];
	let map = keys.into_iter().map(Value::from).zip(params).collect();
	sched.set_client_info(channel, ClientInfo::from_map(map));
	Ok(Value::Nil)
}

fn subscribe(sched: &mut Scheduler, channel: ChannelId, params: Vec<Value>) -> Result<Value, RpcError> {
	let event: String = from_param(&params, 0)?;
	sched.subscribe(channel, event);
	Ok(Value::Nil)
}

fn unsubscribe(sched: &mut Scheduler, channel: ChannelId, params: Vec<Value>) -> Result<Value, RpcError> {
	let event: String = from_param(&params, 0)?;
	sched.unsubscribe(channel, &event);
	Ok(Value::Nil)
}
