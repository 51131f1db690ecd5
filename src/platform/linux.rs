//! Linux backend (§4.2): a single inotify file descriptor for every
//! registered root, multiplexed via `poll(2)` against an `eventfd(2)` used
//! to wake the loop when a command is enqueued.
//!
//! inotify only ever watches the exact directory it was handed; it does not
//! recurse. The event taxonomy's "subtree creation" scenario still expects
//! a `CREATED` event for a file created inside a directory that itself was
//! just created under a watched root, so this backend auto-arms a watch for
//! every directory it sees appear (`IN_CREATE`/`IN_MOVED_TO` with
//! `IN_ISDIR`) under a registered root, joining that to the user-visible
//! behavior of the recursive FSEvents and `ReadDirectoryChangesW` backends.
//! Discovering a root's *pre-existing* subtree at registration time is
//! explicitly out of scope (§1 Non-goals); only directories that appear
//! after registration are picked up.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use tracing::{debug, trace, warn};

use crate::command::{Command, Wake};
use crate::config::Config;
use crate::error::WatchError;
use crate::event::{ChangeType, Event};
use crate::path::{join_record, require_absolute};
use crate::sink::EventHandler;
use crate::watch_point::WatchPointState;

use super::{signal_startup, StartupHandshake, WakerSlot};

/// Mask registered for every watched directory, root or auto-discovered
/// subdirectory alike (§4.2: "the exact mask is an implementation choice
/// consistent with the event taxonomy").
fn watch_mask() -> WatchMask {
	WatchMask::CREATE
		| WatchMask::MODIFY
		| WatchMask::DELETE
		| WatchMask::MOVE
		| WatchMask::ATTRIB
		| WatchMask::CLOSE_WRITE
		| WatchMask::MOVE_SELF
		| WatchMask::DELETE_SELF
		| WatchMask::EXCL_UNLINK
}

/// A registered root, as distinct from the subdirectory watches arming it
/// transitively creates.
struct WatchPoint {
	wd: WatchDescriptor,
	state: WatchPointState,
}

/// One native inotify watch, whether it is a registered root's own watch or
/// a subdirectory discovered underneath one.
struct DirWatch {
	path: PathBuf,
	/// The registered root this directory's events are attributed to, for
	/// overflow grouping and teardown on `unregister`.
	root: PathBuf,
}

struct EventFdWaker(RawFd);

// SAFETY: an eventfd is just an integer counter in the kernel; writing to it
// from any thread is the documented way to use it.
unsafe impl Send for EventFdWaker {}
unsafe impl Sync for EventFdWaker {}

impl Wake for EventFdWaker {
	fn wake(&self) {
		let value: u64 = 1;
		unsafe {
			libc::write(self.0, &value as *const u64 as *const _, 8);
		}
	}
}

impl Drop for EventFdWaker {
	fn drop(&mut self) {
		unsafe {
			libc::close(self.0);
		}
	}
}

/// All native-watch bookkeeping for the lifetime of the backend thread.
struct State {
	/// Registered roots only, keyed by the path the caller passed to
	/// `start_watching`.
	roots: HashMap<PathBuf, WatchPoint>,
	/// Every native watch, root or auto-discovered subdirectory, keyed by
	/// its inotify watch descriptor.
	directories: HashMap<WatchDescriptor, DirWatch>,
	/// Reverse of `directories`, for dedup when a directory-creation event
	/// is about to be auto-armed.
	by_path: HashMap<PathBuf, WatchDescriptor>,
}

impl State {
	fn new() -> Self {
		Self {
			roots: HashMap::new(),
			directories: HashMap::new(),
			by_path: HashMap::new(),
		}
	}

	/// Adds one native watch (used for both roots and auto-discovered
	/// subdirectories) and records it in every index.
	fn arm_directory(
		&mut self,
		inotify: &mut Inotify,
		path: PathBuf,
		root: PathBuf,
	) -> std::io::Result<WatchDescriptor> {
		let wd = inotify.watches().add(&path, watch_mask())?;
		self.by_path.insert(path.clone(), wd.clone());
		self.directories.insert(wd.clone(), DirWatch { path, root });
		Ok(wd)
	}

	/// Removes every native watch (the root's own and every subdirectory
	/// discovered under it) that belongs to `root`.
	fn disarm_root(&mut self, inotify: &mut Inotify, root: &PathBuf) {
		let wds: Vec<WatchDescriptor> = self
			.directories
			.iter()
			.filter(|(_, dir)| &dir.root == root)
			.map(|(wd, _)| wd.clone())
			.collect();
		for wd in wds {
			if let Some(dir) = self.directories.remove(&wd) {
				self.by_path.remove(&dir.path);
			}
			let _ = inotify.watches().remove(wd);
		}
	}

	/// Drops the bookkeeping for a single subdirectory watch without
	/// touching its owning root (the subdirectory's own `IN_DELETE_SELF`/
	/// `IN_MOVE_SELF` fired, which is redundant with the `REMOVED` event its
	/// parent directory already reported).
	fn forget_subdirectory(&mut self, wd: &WatchDescriptor) {
		if let Some(dir) = self.directories.remove(wd) {
			self.by_path.remove(&dir.path);
		}
	}
}

pub(super) fn run(
	_config: Config,
	mut handler: Box<dyn EventHandler>,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	let mut inotify = match Inotify::init() {
		Ok(inotify) => inotify,
		Err(err) => {
			signal_startup(&handshake, Err(format!("inotify_init failed: {err}")));
			return;
		}
	};

	let event_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
	if event_fd < 0 {
		signal_startup(
			&handshake,
			Err(format!(
				"eventfd failed: {}",
				std::io::Error::last_os_error()
			)),
		);
		return;
	}

	*waker_slot.lock().unwrap_or_else(|p| p.into_inner()) =
		Some(Arc::new(EventFdWaker(event_fd)));
	signal_startup(&handshake, Ok(()));
	debug!("linux backend started");

	let mut state = State::new();
	let mut terminated = false;
	let mut read_buffer = [0u8; 4096];

	let inotify_fd = inotify.as_raw_fd();

	while !terminated {
		let mut pollfds = [
			libc::pollfd {
				fd: inotify_fd,
				events: libc::POLLIN,
				revents: 0,
			},
			libc::pollfd {
				fd: event_fd,
				events: libc::POLLIN,
				revents: 0,
			},
		];

		let ready = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
		if ready < 0 {
			let err = std::io::Error::last_os_error();
			if err.kind() == std::io::ErrorKind::Interrupted {
				continue;
			}
			handler.handle_event(Err(WatchError::Io(err)));
			continue;
		}

		if pollfds[1].revents & libc::POLLIN != 0 {
			let mut drain = [0u8; 8];
			unsafe {
				libc::read(event_fd, drain.as_mut_ptr() as *mut _, 8);
			}
			terminated = drain_commands(&mut inotify, &mut state, &commands, &mut handler);
		}

		if terminated {
			break;
		}

		if pollfds[0].revents & libc::POLLIN != 0 {
			process_native_events(&mut inotify, &mut read_buffer, &mut state, &mut handler);
		}
	}

	for root in state.roots.keys().cloned().collect::<Vec<_>>() {
		state.disarm_root(&mut inotify, &root);
	}
	for watch_point in state.roots.values_mut() {
		watch_point.state = WatchPointState::Finished;
	}
	debug!("linux backend stopped");
}

/// Drains every pending command. Returns `true` once `Terminate` has been
/// observed (§4.6: "after `Terminate` is observed, no further commands are
/// processed").
fn drain_commands(
	inotify: &mut Inotify,
	state: &mut State,
	commands: &Receiver<Command>,
	handler: &mut Box<dyn EventHandler>,
) -> bool {
	loop {
		match commands.try_recv() {
			Ok(Command::Register { paths, reply }) => {
				reply.complete(register(inotify, state, paths));
			}
			Ok(Command::Unregister { paths, reply }) => {
				reply.complete(Ok(unregister(inotify, state, paths)));
			}
			Ok(Command::Terminate { reply }) => {
				reply.complete(Ok(()));
				return true;
			}
			Err(TryRecvError::Empty) => return false,
			Err(TryRecvError::Disconnected) => {
				let _ = handler; // nothing left to report to; channel is gone with the server
				return true;
			}
		}
	}
}

fn register(inotify: &mut Inotify, state: &mut State, paths: Vec<PathBuf>) -> crate::error::Result<()> {
	for path in &paths {
		require_absolute(path)?;
		if !path.is_dir() {
			return Err(WatchError::registration(path.clone(), "not a directory"));
		}
		if state.roots.contains_key(path) {
			return Err(WatchError::registration(path.clone(), "already watching"));
		}
	}

	for path in paths {
		let wd = state
			.arm_directory(inotify, path.clone(), path.clone())
			.map_err(|err| WatchError::registration(path.clone(), err.to_string()))?;
		state.roots.insert(
			path,
			WatchPoint {
				wd,
				state: WatchPointState::Listening,
			},
		);
	}
	Ok(())
}

fn unregister(inotify: &mut Inotify, state: &mut State, paths: Vec<PathBuf>) -> bool {
	let mut all_present = true;
	for path in paths {
		if let Some(mut watch_point) = state.roots.remove(&path) {
			watch_point.state = WatchPointState::Cancelled;
			state.disarm_root(inotify, &path);
		} else {
			all_present = false;
		}
	}
	all_present
}

fn process_native_events(
	inotify: &mut Inotify,
	buffer: &mut [u8],
	state: &mut State,
	handler: &mut Box<dyn EventHandler>,
) {
	let events = match inotify.read_events_blocking(buffer) {
		Ok(events) => events,
		Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
		Err(err) => {
			handler.handle_event(Err(WatchError::Io(err)));
			return;
		}
	};

	// Collect follow-up work to run after the borrow on `events` ends, since
	// `inotify.read_events_blocking` borrows `inotify` and arming new
	// watches or removing old ones needs a fresh mutable borrow.
	let mut invalidated_roots = Vec::new();
	let mut stale_subdirectories = Vec::new();
	let mut new_subdirectories: Vec<(PathBuf, PathBuf)> = Vec::new();
	let mut overflowed = false;
	let mut to_emit = Vec::new();

	for record in events {
		if record.mask.contains(EventMask::Q_OVERFLOW) {
			overflowed = true;
			continue;
		}

		let Some(dir) = state.directories.get(&record.wd) else {
			trace!(?record.wd, "event for unknown watch descriptor, ignoring");
			continue;
		};
		let directory = dir.path.clone();
		let root = dir.root.clone();

		if record.mask.intersects(EventMask::MOVE_SELF | EventMask::DELETE_SELF) {
			if state.roots.contains_key(&directory) {
				invalidated_roots.push(directory);
			} else {
				stale_subdirectories.push(record.wd);
			}
			continue;
		}

		if record.mask.contains(EventMask::IGNORED) {
			// Kernel's own acknowledgement of a watch removal; nothing to emit.
			continue;
		}

		let path = match &record.name {
			Some(name) => join_record(&directory, name),
			None => directory.clone(),
		};

		if record.mask.contains(EventMask::ISDIR)
			&& record.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO)
		{
			new_subdirectories.push((path.clone(), root));
		}

		let kind = translate_mask(record.mask);
		to_emit.push(Event::new(kind, path));
	}

	for event in to_emit {
		handler.handle_event(Ok(event));
	}

	if overflowed {
		warn!("inotify queue overflowed; reporting OVERFLOW for every watched root");
		for path in state.roots.keys().cloned().collect::<Vec<_>>() {
			handler.handle_event(Ok(Event::new(ChangeType::Overflow, path)));
		}
	}

	for wd in stale_subdirectories {
		state.forget_subdirectory(&wd);
	}

	for (path, root) in new_subdirectories {
		if state.by_path.contains_key(&path) {
			continue;
		}
		// The directory may already be gone by the time we get here (created
		// and removed in quick succession); a failed add is not an error
		// worth surfacing, just a missed subtree.
		if !path.is_dir() {
			continue;
		}
		if let Err(err) = state.arm_directory(inotify, path.clone(), root) {
			trace!(?path, %err, "failed to auto-arm a newly created subdirectory");
		}
	}

	for root in invalidated_roots {
		handler.handle_event(Ok(Event::new(ChangeType::Invalidated, root.clone())));
		if let Some(mut watch_point) = state.roots.remove(&root) {
			watch_point.state = WatchPointState::Finished;
			state.disarm_root(inotify, &root);
		}
	}
}

/// Translates a raw inotify event mask into a normalized [`ChangeType`]
/// (§4.2 step 3).
fn translate_mask(mask: EventMask) -> ChangeType {
	if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
		ChangeType::Created
	} else if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
		ChangeType::Removed
	} else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB | EventMask::CLOSE_WRITE) {
		ChangeType::Modified
	} else {
		ChangeType::Unknown
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn translates_create_and_moved_to_as_created() {
		assert_eq!(translate_mask(EventMask::CREATE), ChangeType::Created);
		assert_eq!(translate_mask(EventMask::MOVED_TO), ChangeType::Created);
	}

	#[test]
	fn translates_create_with_isdir_as_created() {
		// §4.2 tie-break: IN_CREATE|IN_ISDIR is still CREATED; directory-vs-file
		// is not exposed upward.
		assert_eq!(
			translate_mask(EventMask::CREATE | EventMask::ISDIR),
			ChangeType::Created
		);
	}

	#[test]
	fn translates_delete_and_moved_from_as_removed() {
		assert_eq!(translate_mask(EventMask::DELETE), ChangeType::Removed);
		assert_eq!(translate_mask(EventMask::MOVED_FROM), ChangeType::Removed);
	}

	#[test]
	fn translates_modify_attrib_close_write_as_modified() {
		assert_eq!(translate_mask(EventMask::MODIFY), ChangeType::Modified);
		assert_eq!(translate_mask(EventMask::ATTRIB), ChangeType::Modified);
		assert_eq!(translate_mask(EventMask::CLOSE_WRITE), ChangeType::Modified);
	}

	#[test]
	fn unrecognized_mask_is_unknown() {
		assert_eq!(translate_mask(EventMask::ACCESS), ChangeType::Unknown);
	}
}
