//! Platform Backend dispatch (§4.2-§4.4): one implementation per OS,
//! selected at compile time. Each backend exposes a single `run` function
//! that is the watcher thread's entire body: it performs backend-specific
//! initialization, signals the startup handshake, then pumps its native
//! event loop until `Terminate` is observed.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::command::{Command, Wake};
use crate::config::Config;
use crate::sink::EventHandler;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", windows)))]
mod unsupported;

type StartupResult = std::result::Result<(), String>;
type StartupHandshake = Arc<(Mutex<Option<StartupResult>>, Condvar)>;
type WakerSlot = Arc<Mutex<Option<Arc<dyn Wake>>>>;

/// Signals the startup handshake exactly once: every backend's `run`
/// function calls this before entering its native loop, whether
/// initialization succeeded or failed.
pub(crate) fn signal_startup(handshake: &StartupHandshake, result: StartupResult) {
	let (lock, cvar) = &**handshake;
	let mut slot = lock.lock().unwrap_or_else(|p| p.into_inner());
	*slot = Some(result);
	cvar.notify_all();
}

/// Spawns the watcher thread for the recommended backend on this platform.
pub(crate) fn spawn_backend_thread<H: EventHandler>(
	config: Config,
	handler: H,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) -> JoinHandle<()> {
	let handler: Box<dyn EventHandler> = Box::new(handler);
	thread::Builder::new()
		.name("fswatch-core".into())
		.spawn(move || run(config, handler, commands, waker_slot, handshake))
		.expect("failed to spawn watcher thread")
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn run(
	config: Config,
	handler: Box<dyn EventHandler>,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	linux::run(config, handler, commands, waker_slot, handshake)
}

#[cfg(target_os = "macos")]
fn run(
	config: Config,
	handler: Box<dyn EventHandler>,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	macos::run(config, handler, commands, waker_slot, handshake)
}

#[cfg(windows)]
fn run(
	config: Config,
	handler: Box<dyn EventHandler>,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	windows::run(config, handler, commands, waker_slot, handshake)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", windows)))]
fn run(
	config: Config,
	handler: Box<dyn EventHandler>,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	unsupported::run(config, handler, commands, waker_slot, handshake)
}
