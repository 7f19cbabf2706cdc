use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rstest::rstest;
use xeno_embed::{ChannelSource, EmbedConfig, JobError, JobId, JobOptions, JobState, JobWait, Method, ParamType, Scheduler, Value};

use crate::common::{PATIENCE, recorder, scheduler, scheduler_with};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
	Stdout(Vec<u8>, bool),
	Stderr(Vec<u8>, bool),
	Exit(i32),
}

type Log = Arc<Mutex<Vec<Seen>>>;

fn sh(script: &str) -> JobOptions {
	JobOptions::new(["sh", "-c", script])
}

fn observed(options: JobOptions, log: &Log) -> JobOptions {
	let out = log.clone();
	let err = log.clone();
	let exit = log.clone();
	options
		.on_stdout(move |_, _, data, eof| out.lock().push(Seen::Stdout(data.to_vec(), eof)))
		.on_stderr(move |_, _, data, eof| err.lock().push(Seen::Stderr(data.to_vec(), eof)))
		.on_exit(move |_, _, status| exit.lock().push(Seen::Exit(status)))
}

fn exits(log: &Log) -> Vec<i32> {
	log.lock()
		.iter()
		.filter_map(|seen| match seen {
			Seen::Exit(status) => Some(*status),
			_ => None,
		})
		.collect()
}

fn stdout_text(log: &Log) -> String {
	let bytes: Vec<u8> = log
		.lock()
		.iter()
		.filter_map(|seen| match seen {
			Seen::Stdout(data, _) => Some(data.clone()),
			_ => None,
		})
		.flatten()
		.collect();
	String::from_utf8(bytes).unwrap()
}

fn run_to_exit(sched: &mut Scheduler, log: &Log) {
	assert!(sched.run_until(Some(PATIENCE), |_| !exits(log).is_empty()), "job never exited");
	// Anything after the exit callback would be a duplicate.
	sched.run_until(Some(Duration::from_millis(50)), |_| false);
}

#[test]
fn output_precedes_single_exit() {
	let mut sched = scheduler();
	let log: Log = recorder();
	let id = sched.job_start(observed(sh("printf hello; exit 3"), &log)).unwrap();
	run_to_exit(&mut sched, &log);

	assert_eq!(stdout_text(&log), "hello");
	assert_eq!(exits(&log), vec![3]);
	assert_eq!(log.lock().last(), Some(&Seen::Exit(3)));
	assert!(log.lock().iter().any(|seen| matches!(seen, Seen::Stdout(_, true))));
	assert_eq!(sched.job_state(id), JobState::Reaped);
	assert!(sched.job_ids().is_empty());
}

#[rstest]
#[case::success("exit 0", 0)]
#[case::failure("exit 42", 42)]
#[case::no_output("true", 0)]
#[case::killed("kill -9 $$", 137)]
#[case::terminated("kill -15 $$", 143)]
fn immediate_exit_is_reported_once(#[case] script: &str, #[case] status: i32) {
	let mut sched = scheduler();
	let log: Log = recorder();
	sched.job_start(observed(sh(script), &log)).unwrap();
	run_to_exit(&mut sched, &log);
	assert_eq!(exits(&log), vec![status]);
}

#[test]
fn exit_without_callbacks_still_reaps() {
	let mut sched = scheduler();
	let id = sched.job_start(sh("exit 7")).unwrap();
	assert_eq!(sched.job_wait(id, Some(PATIENCE)), JobWait::Exited(7));
	assert_eq!(sched.job_state(id), JobState::Reaped);
	assert_eq!(sched.job_wait(id, Some(PATIENCE)), JobWait::Exited(7));
	assert_eq!(sched.job_wait(JobId(77), Some(PATIENCE)), JobWait::NotFound);
}

#[test]
fn stdin_round_trips_through_cat() {
	let mut sched = scheduler();
	let log: Log = recorder();
	let id = sched.job_start(observed(JobOptions::new(["cat"]), &log)).unwrap();

	assert!(sched.job_write(id, &b"abc"[..]));
	assert!(sched.job_write(id, "def"));
	assert!(sched.job_close_stdin(id));
	assert!(!sched.job_write(id, "late"));
	assert!(!sched.job_close_stdin(id));

	run_to_exit(&mut sched, &log);
	assert_eq!(stdout_text(&log), "abcdef");
	assert_eq!(exits(&log), vec![0]);
}

#[test]
fn stderr_and_environment() {
	let mut sched = scheduler();
	let log: Log = recorder();
	let dir = tempfile::tempdir().unwrap();
	let options = sh("printf \"$XENO_TEST_VALUE\" >&2; pwd").env("XENO_TEST_VALUE", "from-env").cwd(dir.path());
	sched.job_start(observed(options, &log)).unwrap();
	run_to_exit(&mut sched, &log);

	let stderr: Vec<u8> = log
		.lock()
		.iter()
		.filter_map(|seen| match seen {
			Seen::Stderr(data, _) => Some(data.clone()),
			_ => None,
		})
		.flatten()
		.collect();
	assert_eq!(stderr, b"from-env");
	let cwd = dir.path().canonicalize().unwrap();
	assert_eq!(stdout_text(&log).trim_end(), cwd.display().to_string());
}

#[test]
fn cleared_environment() {
	let mut sched = scheduler();
	let log: Log = recorder();
	let options = JobOptions::new(["/bin/sh", "-c", "printf \"${HOME:-unset}\""]).clear_env();
	sched.job_start(observed(options, &log)).unwrap();
	run_to_exit(&mut sched, &log);
	assert_eq!(stdout_text(&log), "unset");
}

#[test]
fn spawn_failures_are_synchronous() {
	let mut sched = scheduler_with(EmbedConfig::default().max_jobs(1));
	let err = sched.job_start(JobOptions::new(["/nonexistent/xeno-embed-test"])).unwrap_err();
	assert!(matches!(err, JobError::Spawn { ref program, .. } if program == "/nonexistent/xeno-embed-test"));
	let err = sched.job_start(JobOptions::new(Vec::<String>::new())).unwrap_err();
	assert!(matches!(err, JobError::EmptyArgv));

	// Failed spawns do not hold a slot.
	let id = sched.job_start(sh("exit 0")).unwrap();
	assert_eq!(id, JobId(1));
	assert_eq!(sched.job_wait(id, Some(PATIENCE)), JobWait::Exited(0));
}

#[test]
fn table_full_and_id_reuse() {
	let mut sched = scheduler_with(EmbedConfig::default().max_jobs(2));
	let first = sched.job_start(JobOptions::new(["sleep", "30"])).unwrap();
	let second = sched.job_start(JobOptions::new(["sleep", "30"])).unwrap();
	assert_eq!((first, second), (JobId(1), JobId(2)));
	assert!(matches!(sched.job_start(JobOptions::new(["true"])), Err(JobError::TableFull { max: 2 })));

	assert!(sched.job_stop(first).unwrap());
	assert_eq!(sched.job_wait(first, Some(PATIENCE)), JobWait::Exited(143));
	let third = sched.job_start(JobOptions::new(["sleep", "30"])).unwrap();
	assert_eq!(third, JobId(1));

	assert!(sched.teardown(PATIENCE));
	assert!(sched.job_ids().is_empty());
}

#[test]
fn job_stop_is_idempotent() {
	let mut sched = scheduler();
	let log: Log = recorder();
	let id = sched.job_start(observed(JobOptions::new(["sleep", "30"]), &log)).unwrap();
	assert!(sched.job_pid(id).is_some());

	assert!(sched.job_stop(id).unwrap());
	assert!(sched.job_stop(id).unwrap());
	run_to_exit(&mut sched, &log);
	assert_eq!(exits(&log), vec![143]);
	assert!(!sched.job_stop(id).unwrap());
	assert_eq!(sched.job_pid(id), None);
}

#[test]
fn stop_escalates_to_kill() {
	let mut sched = scheduler_with(EmbedConfig::default().kill_timeout(Duration::from_millis(50)));
	let log: Log = recorder();
	let id = sched.job_start(observed(sh("trap '' TERM; exec sleep 30"), &log)).unwrap();
	// Give the shell time to install the trap.
	sched.run_until(Some(Duration::from_millis(200)), |_| false);

	sched.job_stop(id).unwrap();
	run_to_exit(&mut sched, &log);
	assert_eq!(exits(&log), vec![137]);
}

#[test]
fn orphaned_pipes_do_not_delay_exit_forever() {
	let mut sched = scheduler_with(EmbedConfig::default().exit_flush_timeout(Duration::from_millis(50)));
	let log: Log = recorder();
	// The background sleep inherits stdout and keeps it open after sh exits.
	sched.job_start(observed(sh("printf early; sleep 30 & exit 4"), &log)).unwrap();
	run_to_exit(&mut sched, &log);
	assert_eq!(stdout_text(&log), "early");
	assert_eq!(exits(&log), vec![4]);
}

#[test]
fn job_wait_leaves_other_work_queued() {
	let mut sched = scheduler();
	let other: Log = recorder();
	sched.job_start(observed(sh("exit 1"), &other)).unwrap();
	let deferred = recorder::<()>();
	let sink = deferred.clone();
	sched.defer(move |_| sink.lock().push(()));

	let id = sched.job_start(sh("exit 2")).unwrap();
	assert_eq!(sched.job_wait(id, Some(PATIENCE)), JobWait::Exited(2));
	assert!(deferred.lock().is_empty());

	run_to_exit(&mut sched, &other);
	assert_eq!(deferred.lock().len(), 1);
	assert_eq!(exits(&other), vec![1]);
}

#[test]
fn job_wait_times_out() {
	let mut sched = scheduler();
	let id = sched.job_start(JobOptions::new(["sleep", "30"])).unwrap();
	assert_eq!(sched.job_wait(id, Some(Duration::from_millis(30))), JobWait::TimedOut);
	assert_eq!(sched.job_state(id), JobState::Running);
	sched.job_stop(id).unwrap();
	assert_eq!(sched.job_wait(id, Some(PATIENCE)), JobWait::Exited(143));
}

#[test]
fn rpc_job_talks_msgpack() {
	let mut sched = scheduler();
	// `cat` echoes our request back, so we answer it ourselves and then
	// receive that answer as the response to our own request.
	sched.register(Method::new("bump").params([ParamType::Integer]).handler(|_, _, params| {
		Ok(Value::from(params[0].as_i64().unwrap_or_default() + 1))
	}));
	let exit = recorder();
	let exit_sink = exit.clone();
	let id = sched.job_start(JobOptions::new(["cat"]).rpc().on_exit(move |_, _, status| exit_sink.lock().push(status))).unwrap();
	let channel = sched.job_channel(id).unwrap();
	assert_eq!(sched.channel_info(channel).unwrap().source, ChannelSource::Job(id));

	let outcomes = recorder();
	let sink = outcomes.clone();
	sched.send_request(channel, "bump", vec![Value::from(41)], move |_, outcome| sink.lock().push(outcome)).unwrap();
	assert!(sched.run_until(Some(PATIENCE), |_| !outcomes.lock().is_empty()));
	assert_eq!(outcomes.lock()[0].as_ref().ok(), Some(&Value::from(42)));

	sched.job_stop(id).unwrap();
	assert!(sched.run_until(Some(PATIENCE), |s| !exit.lock().is_empty() && s.channel_state(channel).is_none()));
	assert_eq!(exit.lock().len(), 1);
}

#[test]
fn buffered_output_arrives_once_at_eof() {
	let mut sched = scheduler();
	let log: Log = recorder();
	let script = "printf a; sleep 0.05; printf b; printf c >&2; sleep 0.05; printf d >&2";
	sched.job_start(observed(sh(script).stdout_buffered().stderr_buffered(), &log)).unwrap();
	run_to_exit(&mut sched, &log);

	let seen = log.lock().clone();
	let stdout: Vec<&Seen> = seen.iter().filter(|s| matches!(s, Seen::Stdout(..))).collect();
	let stderr: Vec<&Seen> = seen.iter().filter(|s| matches!(s, Seen::Stderr(..))).collect();
	assert_eq!(stdout, [&Seen::Stdout(b"ab".to_vec(), true)]);
	assert_eq!(stderr, [&Seen::Stderr(b"cd".to_vec(), true)]);
	assert_eq!(seen.last(), Some(&Seen::Exit(0)));
}

/// Whether `pid` is still running; zombies count as gone.
#[cfg(target_os = "linux")]
fn alive(pid: u32) -> bool {
	std::fs::read_to_string(format!("/proc/{pid}/stat"))
		.ok()
		.and_then(|stat| stat.rsplit_once(") ").map(|(_, rest)| !rest.starts_with('Z')))
		.unwrap_or(false)
}

#[cfg(target_os = "linux")]
#[test]
fn detached_job_survives_teardown() {
	let mut sched = scheduler();
	let detached_log: Log = recorder();
	let attached_log: Log = recorder();
	let detached = sched.job_start(observed(JobOptions::new(["sleep", "30"]).detach(), &detached_log)).unwrap();
	sched.job_start(observed(JobOptions::new(["sleep", "30"]), &attached_log)).unwrap();
	let pid = sched.job_pid(detached).unwrap();

	assert!(sched.teardown(PATIENCE));
	assert!(sched.job_ids().is_empty());
	assert_eq!(exits(&attached_log), vec![143]);
	assert!(exits(&detached_log).is_empty());
	assert!(alive(pid), "detached job was stopped by teardown");

	std::process::Command::new("kill").args(["-9", &pid.to_string()]).status().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn job_stop_reaches_background_children() {
	let mut sched = scheduler();
	let log: Log = recorder();
	let id = sched.job_start(observed(sh("sleep 30 & echo $!; wait"), &log)).unwrap();
	assert!(sched.run_until(Some(PATIENCE), |_| stdout_text(&log).contains('\n')));
	let grandchild: u32 = stdout_text(&log).trim().parse().unwrap();
	assert!(alive(grandchild));

	sched.job_stop(id).unwrap();
	run_to_exit(&mut sched, &log);
	assert_eq!(exits(&log), vec![143]);
	let deadline = std::time::Instant::now() + PATIENCE;
	while alive(grandchild) && std::time::Instant::now() < deadline {
		std::thread::sleep(Duration::from_millis(10));
	}
	assert!(!alive(grandchild), "grandchild {grandchild} survived job_stop");
}
