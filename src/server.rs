//! Abstract Server (§4.1): the platform-independent skeleton that owns the
//! watcher thread, the command channel, and the event sink. Backend-specific
//! behavior (arming native watches, pumping the native loop, translating raw
//! events) lives entirely in `platform/*`; this module only implements the
//! startup handshake, command submission, and bounded shutdown.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command::{self, Command, CommandSender};
use crate::config::Config;
use crate::error::{Result, WatchError};
use crate::platform;
use crate::sink::EventHandler;

/// Budget for `close()` to join the watcher thread before reporting a fatal
/// shutdown failure (§4.1, §5).
const SHUTDOWN_JOIN_BUDGET: Duration = Duration::from_secs(5);

type StartupResult = std::result::Result<(), String>;
type StartupHandshake = Arc<(Mutex<Option<StartupResult>>, Condvar)>;

/// A long-lived background worker that owns OS watch handles for a set of
/// directory roots and delivers normalized change events to an
/// [`EventHandler`].
///
/// Construct with [`WatchServer::start`], register roots with
/// [`WatchServer::start_watching`], and shut down with
/// [`WatchServer::close`]. All three map directly onto the Abstract
/// Server's `start()`/`submit()`/`close()` contract (§4.1).
pub struct WatchServer {
	commands: CommandSender,
	thread: Option<JoinHandle<()>>,
	config: Config,
}

impl WatchServer {
	/// Launches the watcher thread and blocks until it reports either
	/// successful startup or a startup exception, which is propagated to
	/// the caller (§4.1 "Startup handshake").
	pub fn start<H: EventHandler>(config: Config, handler: H) -> Result<Self> {
		let (commands, command_rx, waker_slot) = command::channel();
		let handshake: StartupHandshake = Arc::new((Mutex::new(None), Condvar::new()));

		let thread = {
			let handshake = Arc::clone(&handshake);
			let config = config.clone();
			platform::spawn_backend_thread(config, handler, command_rx, waker_slot, handshake)
		};

		let (lock, cvar) = &*handshake;
		let mut outcome = lock.lock().unwrap_or_else(|p| p.into_inner());
		while outcome.is_none() {
			outcome = cvar
				.wait(outcome)
				.unwrap_or_else(|p| p.into_inner());
		}
		match outcome.take().expect("startup handshake signalled") {
			Ok(()) => {
				debug!("watch server started");
				Ok(Self {
					commands,
					thread: Some(thread),
					config,
				})
			}
			Err(reason) => {
				// The thread is already unwinding its own init on failure; join
				// it so we don't leak, but don't treat a join failure here as
				// more important than the startup error we're already raising.
				let _ = thread.join();
				Err(WatchError::Startup(reason))
			}
		}
	}

	/// Registers new watch roots (§6 `startWatching`). An empty list is a
	/// no-op success. Fails the whole batch if any path is not absolute, not
	/// a directory, or already watched.
	pub fn start_watching(&self, paths: Vec<PathBuf>) -> Result<()> {
		if paths.is_empty() {
			return Ok(());
		}
		let reply = command::Reply::new();
		self.commands.send(Command::Register {
			paths,
			reply: reply.clone(),
		})?;
		reply.wait(self.config.command_timeout)
	}

	/// Unregisters watch roots (§6 `stopWatching`). Returns `true` iff every
	/// provided path was actually being watched.
	pub fn stop_watching(&self, paths: Vec<PathBuf>) -> Result<bool> {
		if paths.is_empty() {
			return Ok(true);
		}
		let reply = command::Reply::new();
		self.commands.send(Command::Unregister {
			paths,
			reply: reply.clone(),
		})?;
		reply.wait(self.config.command_timeout)
	}

	/// Terminates the server and joins the watcher thread (§4.1 `close()`).
	///
	/// Best-effort: if the thread does not exit within the shutdown budget,
	/// a [`WatchError::ShutdownTimeout`] is returned but the process is left
	/// running regardless (the thread is simply detached).
	pub fn close(mut self) -> Result<()> {
		self.close_inner()
	}

	fn close_inner(&mut self) -> Result<()> {
		let reply = command::Reply::new();
		// `Terminate` may race a backend that already tore itself down; a
		// send failure just means there's nothing left to join either.
		if self.commands.send(Command::Terminate {
			reply: reply.clone(),
		}).is_err() {
			return Ok(());
		}
		let _ = reply.wait(self.config.command_timeout);

		let Some(thread) = self.thread.take() else {
			return Ok(());
		};

		let started = Instant::now();
		// std::thread::JoinHandle has no timed join; the watcher thread is
		// expected to observe `Terminate` and exit promptly, so we poll
		// `is_finished` against the shutdown budget rather than blocking
		// forever on `join()`.
		while !thread.is_finished() {
			if started.elapsed() >= SHUTDOWN_JOIN_BUDGET {
				warn!("watcher thread did not exit within the shutdown budget");
				return Err(WatchError::ShutdownTimeout);
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		let _ = thread.join();
		debug!("watch server closed");
		Ok(())
	}
}

impl Drop for WatchServer {
	fn drop(&mut self) {
		if self.thread.is_some() {
			let _ = self.close_inner();
		}
	}
}
