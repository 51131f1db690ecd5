//! Command Channel (§4.6): the thread-safe queue of register/unregister/
//! terminate commands submitted by caller threads and drained on the
//! watcher thread.
//!
//! Completion is carried per-command rather than through object-identity
//! condition variables (§9, "Command submission with completion + failure
//! carry"): each command owns a [`Reply`] that the watcher thread signals
//! exactly once, and the submitter blocks on that same `Reply` up to
//! `commandTimeoutInMillis`.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, WatchError};

/// A one-shot completion slot shared between a command's submitter and the
/// watcher thread that executes it.
///
/// Cloning shares the same underlying slot; the watcher thread holds one
/// clone (to call [`Reply::complete`]) and the submitter holds another (to
/// call [`Reply::wait`]).
pub(crate) struct Reply<T> {
	state: Arc<(Mutex<Option<Result<T>>>, Condvar)>,
}

impl<T> Clone for Reply<T> {
	fn clone(&self) -> Self {
		Self {
			state: Arc::clone(&self.state),
		}
	}
}

impl<T> Reply<T> {
	pub(crate) fn new() -> Self {
		Self {
			state: Arc::new((Mutex::new(None), Condvar::new())),
		}
	}

	/// Signals completion. A command is completed exactly once, always from
	/// the watcher thread (§3).
	pub(crate) fn complete(&self, result: Result<T>) {
		let (lock, cvar) = &*self.state;
		let mut slot = lock.lock().unwrap_or_else(|poison| poison.into_inner());
		*slot = Some(result);
		cvar.notify_all();
	}

	/// Blocks the caller up to `timeout` for the command to complete.
	///
	/// On timeout, returns [`WatchError::CommandTimeout`] without aborting
	/// the watcher thread: the command may still complete later, but its
	/// result is discarded (no one is left to observe it).
	pub(crate) fn wait(&self, timeout: Duration) -> Result<T> {
		let (lock, cvar) = &*self.state;
		let mut slot = lock.lock().unwrap_or_else(|poison| poison.into_inner());
		let deadline = Instant::now() + timeout;
		loop {
			if let Some(result) = slot.take() {
				return result;
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Err(WatchError::CommandTimeout(timeout));
			}
			let (guard, wait_result) = cvar
				.wait_timeout(slot, remaining)
				.unwrap_or_else(|poison| poison.into_inner());
			slot = guard;
			if wait_result.timed_out() && slot.is_none() {
				return Err(WatchError::CommandTimeout(timeout));
			}
		}
	}
}

/// One entry in the command queue (§3 `Command`).
pub(crate) enum Command {
	/// Register zero or more new watch roots.
	Register {
		paths: Vec<PathBuf>,
		reply: Reply<()>,
	},
	/// Unregister zero or more watch roots; the reply carries `true` iff
	/// every path named was actually being watched.
	Unregister {
		paths: Vec<PathBuf>,
		reply: Reply<bool>,
	},
	/// Shut the watcher thread down. After this is observed, no further
	/// commands are processed (§4.6).
	Terminate { reply: Reply<()> },
}

/// Lets the watcher thread break out of its platform-specific suspension
/// point (poll/CFRunLoopRun/SleepEx) when a command has been enqueued.
///
/// Each backend supplies its own implementation: an eventfd write on Linux,
/// a `CFRunLoopSource` signal on macOS, a no-op `QueueUserAPC` on Windows.
pub(crate) trait Wake: Send + Sync {
	fn wake(&self);
}

/// The caller-thread half of the command channel: enqueue and wake.
#[derive(Clone)]
pub(crate) struct CommandSender {
	tx: mpsc::Sender<Command>,
	waker: Arc<Mutex<Option<Arc<dyn Wake>>>>,
}

impl CommandSender {
	pub(crate) fn send(&self, command: Command) -> Result<()> {
		self.tx
			.send(command)
			.map_err(|_| WatchError::Terminated)?;
		if let Some(waker) = self.waker.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
			waker.wake();
		}
		Ok(())
	}
}

/// Creates a linked `(CommandSender, mpsc::Receiver<Command>, waker slot)`.
/// The watcher thread fills the waker slot in during backend initialization,
/// before the startup handshake completes (see `server.rs`).
pub(crate) fn channel() -> (
	CommandSender,
	mpsc::Receiver<Command>,
	Arc<Mutex<Option<Arc<dyn Wake>>>>,
) {
	let (tx, rx) = mpsc::channel();
	let waker = Arc::new(Mutex::new(None));
	(
		CommandSender {
			tx,
			waker: Arc::clone(&waker),
		},
		rx,
		waker,
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reply_wait_times_out_without_panicking() {
		let reply: Reply<()> = Reply::new();
		let err = reply.wait(Duration::from_millis(10));
		assert!(matches!(err, Err(WatchError::CommandTimeout(_))));
	}

	#[test]
	fn reply_delivers_result_to_waiter() {
		let reply: Reply<bool> = Reply::new();
		let waiter = reply.clone();
		let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));
		std::thread::sleep(Duration::from_millis(20));
		reply.complete(Ok(true));
		assert_eq!(handle.join().unwrap().unwrap(), true);
	}
}
