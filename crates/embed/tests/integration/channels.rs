use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;
use xeno_embed::{CallError, ChannelId, ChannelState, Method, ParamType, RpcError, Scheduler, Value, register_builtins};
use xeno_rpc::{Decoder, Limits, RpcMessage, to_bytes};

use crate::common::{PATIENCE, TICK, open_peer, recorder, scheduler};

fn request_ids(messages: &[RpcMessage]) -> Vec<u64> {
	messages
		.iter()
		.filter_map(|msg| match msg {
			RpcMessage::Request { id, .. } => Some(*id),
			_ => None,
		})
		.collect()
}

#[test]
fn unknown_method_gets_error_response() {
	let mut sched = scheduler();
	let (_, mut peer) = open_peer(&mut sched);

	peer.send(RpcMessage::request(7, "unknown_method", vec![]));
	assert_eq!(
		peer.recv(&mut sched),
		RpcMessage::Response {
			id: 7,
			error: Some(Value::Array(vec![Value::from(2), Value::from("Invalid method: unknown_method")])),
			result: Value::Nil,
		}
	);
}

#[test]
fn notifications_never_get_responses() {
	let mut sched = scheduler();
	let pings = recorder();
	let seen = pings.clone();
	sched.register(Method::new("ping").handler(move |_, channel, _| {
		seen.lock().push(channel);
		Ok(Value::from("pong"))
	}));
	let (a, mut peer_a) = open_peer(&mut sched);
	let (b, mut peer_b) = open_peer(&mut sched);

	peer_a.send(RpcMessage::notification("ping", vec![]));
	peer_b.send(RpcMessage::notification("ping", vec![]));
	peer_a.send(RpcMessage::notification("no_such_method", vec![]));

	assert!(sched.run_until(Some(PATIENCE), |_| pings.lock().len() == 2));
	assert_eq!(peer_a.drain_for(&mut sched, Duration::from_millis(50)), vec![]);
	assert_eq!(peer_b.drain_for(&mut sched, Duration::from_millis(50)), vec![]);
	let mut callers = pings.lock().clone();
	callers.sort_unstable();
	assert_eq!(callers, vec![a, b]);
}

#[test]
fn invalid_params_are_rejected_without_coercion() {
	let mut sched = scheduler();
	sched.register(Method::new("add").params([ParamType::Integer, ParamType::Integer]).handler(|_, _, params| {
		let sum = params.iter().filter_map(Value::as_i64).sum::<i64>();
		Ok(Value::from(sum))
	}));
	let (_, mut peer) = open_peer(&mut sched);

	peer.send(RpcMessage::request(1, "add", vec![Value::from("1"), Value::from(2)]));
	let RpcMessage::Response { id: 1, error: Some(error), .. } = peer.recv(&mut sched) else {
		panic!("expected an error response");
	};
	assert_eq!(error.as_array().and_then(|e| e[0].as_i64()), Some(1));

	peer.send(RpcMessage::request(2, "add", vec![Value::from(1), Value::from(2)]));
	assert_eq!(peer.recv(&mut sched), RpcMessage::response(2, Ok(Value::from(3))));
}

#[test]
fn failing_notification_handler_emits_error_event() {
	let mut sched = scheduler();
	sched.register(Method::new("explode").handler(|_, _, _| Err(RpcError::exception("nope"))));
	let (_, mut peer) = open_peer(&mut sched);

	peer.send(RpcMessage::notification("explode", vec![]));
	assert_eq!(
		peer.recv(&mut sched),
		RpcMessage::notification("error_event", vec![Value::from(0), Value::from("nope")])
	);
}

#[test]
fn panicking_handler_keeps_channel_open() {
	let mut sched = scheduler();
	sched.register(Method::new("panic").handler(|_, _, _| panic!("handler bug")));
	sched.register(Method::new("echo").params([ParamType::Any]).handler(|_, _, mut params| Ok(params.remove(0))));
	let (id, mut peer) = open_peer(&mut sched);

	peer.send(RpcMessage::request(1, "panic", vec![]));
	let RpcMessage::Response { id: 1, error: Some(error), .. } = peer.recv(&mut sched) else {
		panic!("expected an error response");
	};
	assert_eq!(error.as_array().and_then(|e| e[0].as_i64()), Some(0));

	peer.send(RpcMessage::request(2, "echo", vec![Value::from(true)]));
	assert_eq!(peer.recv(&mut sched), RpcMessage::response(2, Ok(Value::from(true))));
	assert_eq!(sched.channel_state(id), Some(ChannelState::Established));
}

#[test]
fn fast_handlers_answer_before_safe_points() {
	let mut sched = scheduler();
	sched.register(Method::new("fast").fast().handler(|_, _, _| Ok(Value::from("fast"))));
	sched.register(Method::new("slow").handler(|_, _, _| Ok(Value::from("slow"))));
	let (_, mut peer) = open_peer(&mut sched);

	peer.send(RpcMessage::request(1, "slow", vec![]));
	peer.send(RpcMessage::request(2, "fast", vec![]));

	// Poll I/O only: deferred work waits for process_events.
	let mut first = None;
	for _ in 0..2000 {
		sched.poll_io(Some(TICK));
		first = peer.recv_within(&mut sched, Duration::ZERO);
		if first.is_some() {
			break;
		}
	}
	assert_eq!(first, Some(RpcMessage::response(2, Ok(Value::from("fast")))));
	sched.poll_io(Some(Duration::from_millis(20)));
	assert_eq!(peer.recv_within(&mut sched, Duration::ZERO), None);

	sched.process_events();
	assert_eq!(peer.recv(&mut sched), RpcMessage::response(1, Ok(Value::from("slow"))));
}

#[rstest]
#[case::in_order(vec![0, 1, 2, 3, 4, 5])]
#[case::reversed(vec![5, 4, 3, 2, 1, 0])]
#[case::interleaved(vec![3, 0, 5, 1, 4, 2])]
fn responses_in_any_order_reach_their_continuations(#[case] order: Vec<usize>) {
	let mut sched = scheduler();
	let (id, mut peer) = open_peer(&mut sched);
	let outcomes = recorder();

	let count = u64::try_from(order.len()).unwrap();
	for n in 0..count {
		let sink = outcomes.clone();
		sched
			.send_request(id, "square", vec![Value::from(n)], move |_, outcome| sink.lock().push((n, outcome)))
			.unwrap();
	}

	let mut requests = Vec::new();
	while requests.len() < order.len() {
		match peer.recv(&mut sched) {
			RpcMessage::Request { id, params, .. } => requests.push((id, params[0].as_u64().unwrap())),
			other => panic!("unexpected {other:?}"),
		}
	}
	for &index in &order {
		let (request_id, n) = requests[index];
		peer.send(RpcMessage::response(request_id, Ok(Value::from(n * n))));
	}

	assert!(sched.run_until(Some(PATIENCE), |_| outcomes.lock().len() == order.len()));
	peer.drain_for(&mut sched, Duration::from_millis(30));
	let mut results = outcomes.lock().drain(..).map(|(n, outcome)| (n, outcome.unwrap())).collect::<Vec<_>>();
	results.sort_by_key(|(n, _)| *n);
	let expected = (0..count).map(|n| (n, Value::from(n * n))).collect::<Vec<_>>();
	assert_eq!(results, expected);
}

#[test]
fn request_ids_are_fresh_per_channel() {
	let mut sched = scheduler();
	let (a, mut peer_a) = open_peer(&mut sched);
	let (b, mut peer_b) = open_peer(&mut sched);

	for _ in 0..3 {
		sched.send_request(a, "m", vec![], |_, _| {}).unwrap();
	}
	sched.send_request(b, "m", vec![], |_, _| {}).unwrap();

	assert_eq!(request_ids(&peer_a.drain_for(&mut sched, Duration::from_millis(50))), vec![1, 2, 3]);
	assert_eq!(request_ids(&peer_b.drain_for(&mut sched, Duration::from_millis(50))), vec![1]);
}

#[rstest]
#[case::local_close(true)]
#[case::peer_hangup(false)]
fn teardown_fails_each_pending_request_once(#[case] local: bool) {
	const PENDING: usize = 4;
	let mut sched = scheduler();
	let (id, mut peer) = open_peer(&mut sched);
	let outcomes = recorder();
	let closed = recorder();
	let closed_sink = closed.clone();
	sched.on_channel_close(move |_, channel| closed_sink.lock().push(channel));

	for _ in 0..PENDING {
		let sink = outcomes.clone();
		sched.send_request(id, "never", vec![], move |_, outcome| sink.lock().push(outcome)).unwrap();
	}
	peer.drain_for(&mut sched, Duration::from_millis(20));

	if local {
		assert!(sched.close_channel(id));
		assert!(!sched.close_channel(id));
	} else {
		drop(peer);
	}

	assert!(sched.run_until(Some(PATIENCE), |s| s.channel_state(id).is_none()));
	sched.run_until(Some(Duration::from_millis(50)), |_| false);

	let outcomes = outcomes.lock();
	assert_eq!(outcomes.len(), PENDING);
	assert!(outcomes.iter().all(|outcome| matches!(outcome, Err(CallError::Disconnected(_)))));
	assert_eq!(*closed.lock(), vec![id]);
}

#[test]
fn requests_on_closed_channels_fail_synchronously() {
	let mut sched = scheduler();
	let (id, _peer) = open_peer(&mut sched);
	sched.close_channel(id);

	let ran = recorder::<()>();
	let sink = ran.clone();
	let err = sched.send_request(id, "m", vec![], move |_, _| sink.lock().push(())).unwrap_err();
	assert!(matches!(err, CallError::NotEstablished(_)));
	assert!(sched.run_until(Some(PATIENCE), |s| s.channel_state(id).is_none()));

	let err = sched.send_request(id, "m", vec![], |_, _| {}).unwrap_err();
	assert!(matches!(err, CallError::InvalidChannel(_)));
	assert!(ran.lock().is_empty());
}

#[test]
fn timeout_then_late_response_is_discarded() {
	let mut sched = scheduler();
	let (id, mut peer) = open_peer(&mut sched);
	let outcomes = recorder();
	let sink = outcomes.clone();

	let request = sched
		.send_request_with_timeout(id, "slow", vec![], Some(Duration::from_millis(20)), move |_, outcome| sink.lock().push(outcome))
		.unwrap();
	assert!(sched.run_until(Some(PATIENCE), |_| !outcomes.lock().is_empty()));
	assert!(matches!(outcomes.lock()[0], Err(CallError::TimedOut)));

	peer.send(RpcMessage::response(request, Ok(Value::from("late"))));
	peer.drain_for(&mut sched, Duration::from_millis(50));
	assert_eq!(outcomes.lock().len(), 1);
	assert_eq!(sched.channel_state(id), Some(ChannelState::Established));

	// The same id again is now unknown, which is a protocol violation.
	peer.send(RpcMessage::response(request, Ok(Value::Nil)));
	assert!(peer.wait_eof(&mut sched));
}

#[test]
fn response_before_timeout_wins() {
	let mut sched = scheduler();
	let (id, mut peer) = open_peer(&mut sched);
	let outcomes = recorder();
	let sink = outcomes.clone();

	sched
		.send_request_with_timeout(id, "quick", vec![], Some(Duration::from_millis(100)), move |_, outcome| sink.lock().push(outcome))
		.unwrap();
	let RpcMessage::Request { id: request, .. } = peer.recv(&mut sched) else {
		panic!("expected the request");
	};
	peer.send(RpcMessage::response(request, Ok(Value::from("on time"))));

	assert!(sched.run_until(Some(PATIENCE), |_| !outcomes.lock().is_empty()));
	sched.run_until(Some(Duration::from_millis(200)), |_| false);
	let outcomes = outcomes.lock();
	assert_eq!(outcomes.len(), 1);
	assert_eq!(outcomes[0].as_ref().ok(), Some(&Value::from("on time")));
}

#[test]
fn remote_errors_reach_the_continuation() {
	let mut sched = scheduler();
	let (id, mut peer) = open_peer(&mut sched);
	let outcomes = recorder();
	let sink = outcomes.clone();

	sched.send_request(id, "fails", vec![], move |_, outcome| sink.lock().push(outcome)).unwrap();
	let RpcMessage::Request { id: request, .. } = peer.recv(&mut sched) else {
		panic!("expected the request");
	};
	peer.send(RpcMessage::response(request, Err(RpcError::validation("bad"))));

	assert!(sched.run_until(Some(PATIENCE), |_| !outcomes.lock().is_empty()));
	let Err(CallError::Remote(remote)) = &outcomes.lock()[0] else {
		panic!("expected a remote error");
	};
	assert_eq!(remote.code(), Some(1));
	assert_eq!(remote.message(), Some("bad"));
}

#[rstest]
#[case::unknown_response_id(to_bytes(RpcMessage::response(99, Ok(Value::Nil))).unwrap().to_vec())]
#[case::reserved_marker(vec![0xc1])]
#[case::not_a_message(vec![0x05])]
fn protocol_errors_close_only_that_channel(#[case] garbage: Vec<u8>) {
	let mut sched = scheduler();
	let (bad, mut bad_peer) = open_peer(&mut sched);
	let (good, mut good_peer) = open_peer(&mut sched);

	bad_peer.send_raw(&garbage);
	assert!(bad_peer.wait_eof(&mut sched));
	assert!(sched.run_until(Some(PATIENCE), |s| s.channel_state(bad).is_none()));

	sched.send_notification(good, "still_here", vec![]).unwrap();
	assert_eq!(good_peer.recv(&mut sched), RpcMessage::notification("still_here", vec![]));
}

#[test]
fn split_frames_are_reassembled() {
	let mut sched = scheduler();
	sched.register(Method::new("echo").params([ParamType::Any]).handler(|_, _, mut params| Ok(params.remove(0))));
	let (_, mut peer) = open_peer(&mut sched);

	let payload = Value::from("x".repeat(10_000));
	let bytes = to_bytes(RpcMessage::request(3, "echo", vec![payload.clone()])).unwrap();
	let (head, tail) = bytes.split_at(bytes.len() / 2);
	peer.send_raw(head);
	peer.drain_for(&mut sched, Duration::from_millis(20));
	peer.send_raw(tail);
	assert_eq!(peer.recv(&mut sched), RpcMessage::response(3, Ok(payload)));
}

#[test]
fn broadcast_reaches_subscribers_only() {
	let mut sched = scheduler();
	register_builtins(&mut sched);
	let (_, mut subscribed) = open_peer(&mut sched);
	let (_, mut other) = open_peer(&mut sched);

	subscribed.send(RpcMessage::request(1, "subscribe", vec![Value::from("redraw")]));
	assert_eq!(subscribed.recv(&mut sched), RpcMessage::response(1, Ok(Value::Nil)));

	assert_eq!(sched.broadcast("redraw", vec![Value::from(1)]), 1);
	assert_eq!(subscribed.recv(&mut sched), RpcMessage::notification("redraw", vec![Value::from(1)]));
	assert_eq!(other.drain_for(&mut sched, Duration::from_millis(30)), vec![]);

	subscribed.send(RpcMessage::request(2, "unsubscribe", vec![Value::from("redraw")]));
	assert_eq!(subscribed.recv(&mut sched), RpcMessage::response(2, Ok(Value::Nil)));
	assert_eq!(sched.broadcast("redraw", vec![]), 0);
}

#[test]
fn client_info_is_visible_through_introspection() {
	let mut sched = scheduler();
	register_builtins(&mut sched);
	let (id, mut peer) = open_peer(&mut sched);

	let version = Value::Map(vec![(Value::from("major"), Value::from(1))]);
	peer.send(RpcMessage::request(
		1,
		"set_client_info",
		vec![Value::from("gui"), version, Value::from("ui"), Value::Map(vec![]), Value::Map(vec![])],
	));
	assert_eq!(peer.recv(&mut sched), RpcMessage::response(1, Ok(Value::Nil)));

	let info = sched.channel_info(id).unwrap();
	assert_eq!(info.client.name.as_deref(), Some("gui"));
	assert_eq!(info.client.kind, xeno_rpc::ClientType::Ui);

	peer.send(RpcMessage::request(2, "get_chan_info", vec![Value::from(0)]));
	let RpcMessage::Response { id: 2, error: None, result } = peer.recv(&mut sched) else {
		panic!("expected a result");
	};
	let fields = result.as_map().unwrap();
	let lookup = |key: &str| fields.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v.clone());
	assert_eq!(lookup("id"), Some(Value::from(id.0)));
	assert!(lookup("client").is_some());
}

/// A channel whose far end is a plain blocking socket, for a peer thread.
fn blocking_channel(sched: &mut Scheduler) -> (ChannelId, UnixStream) {
	let (ours, theirs) = UnixStream::pair().unwrap();
	ours.set_nonblocking(true).unwrap();
	let (reader, writer) = {
		let _guard = sched.enter();
		tokio::net::UnixStream::from_std(ours).unwrap().into_split()
	};
	(sched.open_channel(reader, writer), theirs)
}

/// Reads from `stream` until a request arrives.
fn read_request(stream: &mut UnixStream) -> (u64, Vec<Value>) {
	let mut decoder = Decoder::new(Limits::default());
	let mut buf = [0u8; 1024];
	loop {
		let n = stream.read(&mut buf).unwrap();
		assert!(n > 0, "scheduler hung up");
		decoder.feed(&buf[..n]);
		if let Some(RpcMessage::Request { id, params, .. }) = decoder.next_message().unwrap() {
			return (id, params);
		}
	}
}

#[test]
fn request_blocking_waits_for_the_peer() {
	let mut sched = scheduler();
	let (id, theirs) = blocking_channel(&mut sched);

	let responder = std::thread::spawn(move || {
		let mut stream = theirs;
		let (request, params) = read_request(&mut stream);
		let reply = to_bytes(RpcMessage::response(request, Ok(Value::Array(params)))).unwrap();
		stream.write_all(&reply).unwrap();
	});

	let deferred = recorder::<()>();
	let sink = deferred.clone();
	sched.defer(move |_| sink.lock().push(()));

	let result = sched.request_blocking(id, "echo", vec![Value::from(5)], Some(PATIENCE));
	assert_eq!(result.unwrap(), Value::Array(vec![Value::from(5)]));
	// Unrelated deferred work stayed queued while blocking.
	assert!(deferred.lock().is_empty());
	sched.process_events();
	assert_eq!(deferred.lock().len(), 1);
	responder.join().unwrap();
}

#[test]
fn request_blocking_fails_when_the_peer_hangs_up() {
	let mut sched = scheduler();
	let (id, theirs) = blocking_channel(&mut sched);
	let closed = recorder();
	let sink = closed.clone();
	sched.on_channel_close(move |_, channel| sink.lock().push(channel));

	let peer = std::thread::spawn(move || {
		let mut stream = theirs;
		read_request(&mut stream);
		stream.shutdown(std::net::Shutdown::Both).unwrap();
	});

	let result = sched.request_blocking(id, "never_answered", vec![], Some(PATIENCE));
	assert!(matches!(result, Err(CallError::Disconnected(channel)) if channel == id.0), "{result:?}");
	peer.join().unwrap();

	sched.run_until(Some(Duration::from_millis(50)), |_| false);
	assert_eq!(*closed.lock(), vec![id]);
	assert_eq!(sched.channel_state(id), None);
}

#[test]
fn request_blocking_times_out_and_drops_the_late_answer() {
	let mut sched = scheduler();
	let (id, theirs) = blocking_channel(&mut sched);
	let (answer_now, answer) = std::sync::mpsc::channel::<()>();

	let peer = std::thread::spawn(move || {
		let mut stream = theirs;
		let (request, _) = read_request(&mut stream);
		answer.recv().unwrap();
		let reply = to_bytes(RpcMessage::response(request, Ok(Value::from("late")))).unwrap();
		stream.write_all(&reply).unwrap();
		stream
	});

	let result = sched.request_blocking(id, "slow", vec![], Some(Duration::from_millis(50)));
	assert!(matches!(result, Err(CallError::TimedOut)), "{result:?}");

	answer_now.send(()).unwrap();
	let _stream = peer.join().unwrap();
	sched.run_until(Some(Duration::from_millis(100)), |_| false);
	// The tombstoned id absorbs the answer; the channel stays up.
	assert_eq!(sched.channel_state(id), Some(ChannelState::Established));
}

#[test]
fn backpressure_refuses_new_requests() {
	let config = xeno_embed::EmbedConfig::default().max_pending_write_bytes(0);
	let mut sched = crate::common::scheduler_with(config);
	let (id, _peer) = open_peer(&mut sched);

	let big = Value::Binary(vec![0u8; 8 * 1024 * 1024]);
	// The first write is accepted and stays queued until the loop runs.
	sched.send_notification(id, "bulk", vec![big]).unwrap();
	assert!(matches!(sched.send_request(id, "m", vec![], |_, _| {}), Err(CallError::Backpressure { .. })));
}
