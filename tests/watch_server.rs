//! Integration tests against the real native backend for the host platform.
//!
//! These exercise the public `WatchServer` surface end to end: a throwaway
//! directory tree, a real watcher thread, and actual filesystem mutations.
//! Every test gives the OS a generous timeout to deliver events rather than
//! asserting on exact timing.

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use fswatch_core::{ChangeType, Config, Event, WatchError, WatchServer};
use tempfile::tempdir;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn start_server() -> (WatchServer, mpsc::Receiver<Result<Event, WatchError>>) {
	let _ = tracing_subscriber::fmt::try_init();
	let (tx, rx) = mpsc::channel();
	let server = WatchServer::start(Config::default(), tx).expect("server should start");
	(server, rx)
}

/// Drains events until one matching both `path` and `kind` is seen, or the
/// timeout elapses. Matching on kind too (not just path) matters here: a
/// single filesystem operation can produce more than one normalized event
/// for the same path (e.g. a create followed by a close-write), so a
/// path-only match could return a stale event left over from an earlier
/// step instead of the one the test is actually waiting on.
fn expect_event(
	rx: &mpsc::Receiver<Result<Event, WatchError>>,
	path: &PathBuf,
	kind: ChangeType,
) -> Event {
	let deadline = std::time::Instant::now() + EVENT_TIMEOUT;
	loop {
		let remaining = deadline.saturating_duration_since(std::time::Instant::now());
		if remaining.is_zero() {
			panic!("timed out waiting for a {kind:?} event on {path:?}");
		}
		match rx.recv_timeout(remaining) {
			Ok(Ok(event)) if &event.path == path && event.kind == kind => return event,
			Ok(Ok(_other)) => continue,
			Ok(Err(err)) => panic!("unexpected error event: {err}"),
			Err(_) => panic!("channel closed while waiting for an event on {path:?}"),
		}
	}
}

#[test]
fn create_then_modify_then_delete() {
	let dir = tempdir().expect("tempdir");
	let (server, rx) = start_server();
	server
		.start_watching(vec![dir.path().to_path_buf()])
		.expect("start_watching");

	let file = dir.path().join("hello.txt");
	fs::write(&file, b"one").expect("create");
	expect_event(&rx, &file, ChangeType::Created);

	fs::write(&file, b"two").expect("modify");
	expect_event(&rx, &file, ChangeType::Modified);

	fs::remove_file(&file).expect("delete");
	expect_event(&rx, &file, ChangeType::Removed);

	server.close().expect("close");
}

#[test]
fn rename_within_root_reports_removal_and_creation() {
	let dir = tempdir().expect("tempdir");
	let (server, rx) = start_server();
	server
		.start_watching(vec![dir.path().to_path_buf()])
		.expect("start_watching");

	let old_path = dir.path().join("before.txt");
	let new_path = dir.path().join("after.txt");
	fs::write(&old_path, b"data").expect("create");
	expect_event(&rx, &old_path, ChangeType::Created);

	fs::rename(&old_path, &new_path).expect("rename");
	expect_event(&rx, &old_path, ChangeType::Removed);
	expect_event(&rx, &new_path, ChangeType::Created);

	server.close().expect("close");
}

#[test]
fn subtree_creation_is_observed() {
	let dir = tempdir().expect("tempdir");
	let (server, rx) = start_server();
	server
		.start_watching(vec![dir.path().to_path_buf()])
		.expect("start_watching");

	let nested_dir = dir.path().join("nested");
	fs::create_dir(&nested_dir).expect("mkdir");
	expect_event(&rx, &nested_dir, ChangeType::Created);

	let nested_file = nested_dir.join("leaf.txt");
	fs::write(&nested_file, b"leaf").expect("create nested file");
	expect_event(&rx, &nested_file, ChangeType::Created);

	server.close().expect("close");
}

#[test]
fn double_registration_of_the_same_root_fails() {
	let dir = tempdir().expect("tempdir");
	let (server, _rx) = start_server();
	server
		.start_watching(vec![dir.path().to_path_buf()])
		.expect("first registration succeeds");

	let err = server
		.start_watching(vec![dir.path().to_path_buf()])
		.expect_err("second registration of the same root must fail");
	assert!(matches!(err, WatchError::Registration { .. }));

	server.close().expect("close");
}

#[test]
fn registration_of_a_relative_path_fails() {
	let (server, _rx) = start_server();
	let err = server
		.start_watching(vec![PathBuf::from("relative/path")])
		.expect_err("relative paths must be rejected");
	assert!(matches!(err, WatchError::Registration { .. }));
	server.close().expect("close");
}

#[test]
fn registration_of_a_missing_path_fails() {
	let dir = tempdir().expect("tempdir");
	let missing = dir.path().join("does-not-exist");
	let (server, _rx) = start_server();
	let err = server
		.start_watching(vec![missing])
		.expect_err("a path that is not a directory must be rejected");
	assert!(matches!(err, WatchError::Registration { .. }));
	server.close().expect("close");
}

#[test]
fn unregister_stops_events_for_that_root() {
	let dir = tempdir().expect("tempdir");
	let (server, rx) = start_server();
	server
		.start_watching(vec![dir.path().to_path_buf()])
		.expect("start_watching");

	let all_present = server
		.stop_watching(vec![dir.path().to_path_buf()])
		.expect("stop_watching");
	assert!(all_present);

	let file = dir.path().join("after-unregister.txt");
	fs::write(&file, b"data").expect("create after unregister");

	match rx.recv_timeout(Duration::from_millis(500)) {
		Err(mpsc::RecvTimeoutError::Timeout) => {}
		Ok(Ok(event)) => panic!("unexpected event after unregister: {event:?}"),
		Ok(Err(err)) => panic!("unexpected error after unregister: {err}"),
		Err(mpsc::RecvTimeoutError::Disconnected) => {}
	}

	server.close().expect("close");
}

#[test]
fn unregistering_a_root_that_was_never_registered_reports_false() {
	let dir = tempdir().expect("tempdir");
	let (server, _rx) = start_server();
	let all_present = server
		.stop_watching(vec![dir.path().to_path_buf()])
		.expect("stop_watching on an unknown root still succeeds");
	assert!(!all_present);
	server.close().expect("close");
}

#[test]
fn empty_batches_are_no_ops() {
	let (server, _rx) = start_server();
	server.start_watching(Vec::new()).expect("empty register");
	assert!(server.stop_watching(Vec::new()).expect("empty unregister"));
	server.close().expect("close");
}

#[test]
fn close_can_be_called_without_any_watched_roots() {
	let (server, _rx) = start_server();
	server.close().expect("close with nothing registered");
}

/// Windows overflow-prevention: a tiny overlapped buffer fed a burst of
/// changes it cannot keep up with completes with zero bytes transferred,
/// which §4.4 maps to `INVALIDATED` for the affected root (the client must
/// re-register to resume watching it) rather than `OVERFLOW` — that variant
/// is reserved for the Linux (`IN_Q_OVERFLOW`) and macOS (`MustScanSubDirs`)
/// backends, see src/platform/windows.rs's zero-byte-completion branch.
#[cfg(windows)]
#[test]
fn small_buffer_reports_invalidated_under_a_change_burst() {
	let dir = tempdir().expect("tempdir");
	let (tx, rx) = mpsc::channel();
	let config = Config {
		buffer_size_bytes: fswatch_core::MIN_BUFFER_SIZE_BYTES,
		..Config::default()
	};
	let server = WatchServer::start(config, tx).expect("server should start");
	server
		.start_watching(vec![dir.path().to_path_buf()])
		.expect("start_watching");

	for i in 0..2000 {
		let _ = fs::write(dir.path().join(format!("burst-{i}.txt")), b"x");
	}

	let deadline = std::time::Instant::now() + EVENT_TIMEOUT;
	let mut saw_invalidated = false;
	while std::time::Instant::now() < deadline {
		match rx.recv_timeout(Duration::from_millis(200)) {
			Ok(Ok(event)) if event.kind == ChangeType::Invalidated => {
				saw_invalidated = true;
				break;
			}
			Ok(_) => continue,
			Err(mpsc::RecvTimeoutError::Timeout) => continue,
			Err(mpsc::RecvTimeoutError::Disconnected) => break,
		}
	}
	assert!(saw_invalidated, "expected at least one INVALIDATED event");

	server.close().expect("close");
}
