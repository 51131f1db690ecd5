//! Fallback for targets with no native backend in this crate. The three
//! platforms in scope (§1) are Linux, macOS, and Windows; anywhere else,
//! startup fails synchronously rather than silently doing nothing.

use std::sync::mpsc::Receiver;

use crate::command::Command;
use crate::config::Config;
use crate::sink::EventHandler;

use super::{signal_startup, StartupHandshake, WakerSlot};

pub(super) fn run(
	_config: Config,
	_handler: Box<dyn EventHandler>,
	_commands: Receiver<Command>,
	_waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	signal_startup(
		&handshake,
		Err("no native file-watching backend is available on this platform".into()),
	);
}
