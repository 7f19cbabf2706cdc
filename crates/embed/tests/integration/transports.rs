use std::time::Duration;

use pretty_assertions::assert_eq;
use xeno_embed::{ChannelState, Error, Method, ParamType, Scheduler, Value};

use crate::common::{PATIENCE, recorder, scheduler};

fn all_established(sched: &Scheduler, count: usize) -> bool {
	let ids = sched.channel_ids();
	ids.len() == count && ids.iter().all(|&id| sched.channel_state(id) == Some(ChannelState::Established))
}

fn round_trip(sched: &mut Scheduler, address: &str) {
	sched.register(Method::new("add").params([ParamType::Integer, ParamType::Integer]).handler(|_, _, params| {
		Ok(Value::from(params.iter().filter_map(Value::as_i64).sum::<i64>()))
	}));

	let client = sched.connect(address).unwrap();
	assert_eq!(sched.channel_state(client), Some(ChannelState::Connecting));
	assert!(sched.run_until(Some(PATIENCE), |s| all_established(s, 2)));

	let outcomes = recorder();
	let sink = outcomes.clone();
	sched
		.send_request(client, "add", vec![Value::from(2), Value::from(3)], move |_, outcome| sink.lock().push(outcome))
		.unwrap();
	assert!(sched.run_until(Some(PATIENCE), |_| !outcomes.lock().is_empty()));
	assert_eq!(outcomes.lock()[0].as_ref().ok(), Some(&Value::from(5)));
}

#[test]
fn unix_socket_round_trip() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("embed.sock");
	let mut sched = scheduler();

	let bound = sched.listen(path.to_str().unwrap()).unwrap();
	assert_eq!(sched.listen_addresses(), vec![bound.clone()]);
	round_trip(&mut sched, &bound);

	assert!(sched.stop_listening(&bound));
	assert!(!path.exists());
	assert!(sched.listen_addresses().is_empty());
}

#[test]
fn tcp_round_trip() {
	let mut sched = scheduler();
	let bound = sched.listen("127.0.0.1:0").unwrap();
	assert!(bound.starts_with("127.0.0.1:"));
	assert!(!bound.ends_with(":0"));
	round_trip(&mut sched, &bound);
}

#[test]
fn stale_socket_files_are_replaced() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("stale.sock");
	std::fs::write(&path, b"").unwrap();

	let mut sched = scheduler();
	let bound = sched.listen(path.to_str().unwrap()).unwrap();
	assert!(matches!(sched.listen(&bound), Err(Error::AlreadyListening(_))));
}

#[test]
fn live_sockets_are_not_stolen() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("live.sock");
	let mut owner = scheduler();
	owner.listen(path.to_str().unwrap()).unwrap();

	let mut intruder = scheduler();
	assert!(matches!(intruder.listen(path.to_str().unwrap()), Err(Error::Io(_))));
	assert!(path.exists());
}

#[test]
fn failed_connect_closes_the_channel() {
	let dir = tempfile::tempdir().unwrap();
	let mut sched = scheduler();
	let closed = recorder();
	let sink = closed.clone();
	sched.on_channel_close(move |_, id| sink.lock().push(id));

	let id = sched.connect(dir.path().join("nobody.sock").to_str().unwrap()).unwrap();
	assert!(sched.run_until(Some(PATIENCE), |s| s.channel_state(id).is_none()));
	assert_eq!(*closed.lock(), vec![id]);
}

#[test]
fn teardown_closes_everything() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("teardown.sock");
	let mut sched = scheduler();
	let bound = sched.listen(path.to_str().unwrap()).unwrap();
	sched.connect(&bound).unwrap();
	assert!(sched.run_until(Some(PATIENCE), |s| all_established(s, 2)));
	sched.job_start(xeno_embed::JobOptions::new(["sleep", "30"])).unwrap();

	assert!(sched.teardown(Duration::from_secs(10)));
	assert!(sched.channel_ids().is_empty());
	assert!(sched.job_ids().is_empty());
	assert!(!path.exists());
}
