//! Windows backend (§4.4): `ReadDirectoryChangesW` with overlapped I/O,
//! dispatched through completion routines that the OS delivers as APCs.
//! The watcher thread spends its whole life in an alertable wait
//! (`SleepEx(INFINITE, TRUE)`); both command delivery and I/O completion
//! wake it the same way, via APC.
//!
//! Because every completion routine and every command is processed on this
//! one thread, [`Shared`] and [`WatchPointCtx`] need no internal
//! synchronization — the "cyclic reference" problem in §9 (a watch point's
//! completion routine must reach back into the server) is solved with a
//! raw, non-owning pointer rather than a `Weak`/`Arc` cycle, since the
//! server strictly outlives every watch point it owns.

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use windows_sys::Win32::Foundation::{
	CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, ERROR_ACCESS_DENIED,
	ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
	CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
	FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
	FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
	FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
	FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_WRITE,
	FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
	FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
	GetCurrentProcess, GetCurrentThread, QueueUserAPC, SetThreadPriority, SleepEx,
	THREAD_PRIORITY_ABOVE_NORMAL,
};

use crate::command::{Command, Wake};
use crate::config::Config;
use crate::error::WatchError;
use crate::event::{ChangeType, Event};
use crate::path::{join_record, require_absolute, to_extended_length};
use crate::sink::EventHandler;
use crate::watch_point::WatchPointState;

use super::{signal_startup, StartupHandshake, WakerSlot};

/// §5: "close() ... on Windows, waits one APC cycle" before giving up on a
/// watch point that hasn't reported its cancellation yet.
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Value `SleepEx` returns when it was woken by a completed APC rather than
/// timing out.
const WAIT_IO_COMPLETION: u32 = 0xC0;

fn notify_filter() -> u32 {
	FILE_NOTIFY_CHANGE_FILE_NAME
		| FILE_NOTIFY_CHANGE_DIR_NAME
		| FILE_NOTIFY_CHANGE_ATTRIBUTES
		| FILE_NOTIFY_CHANGE_SIZE
		| FILE_NOTIFY_CHANGE_LAST_WRITE
		| FILE_NOTIFY_CHANGE_LAST_ACCESS
		| FILE_NOTIFY_CHANGE_CREATION
		| FILE_NOTIFY_CHANGE_SECURITY
}

/// Per-root native state: the directory handle, its overlapped-I/O buffer,
/// and the back-reference to [`Shared`] that the completion routine uses to
/// reach the event sink and the watch-point map (§3, §9).
struct WatchPointCtx {
	/// The path as registered by the caller (long-path-rewritten form
	/// stripped back off before reporting; see §4.4 "Path construction").
	report_root: PathBuf,
	handle: HANDLE,
	buffer: Vec<u8>,
	state: WatchPointState,
	shared: *mut Shared,
}

// SAFETY: a Windows HANDLE is just an opaque kernel object reference; moving
// the owning struct across threads (it is constructed on the watcher thread
// and only ever touched there afterward) is sound.
unsafe impl Send for WatchPointCtx {}

struct Shared {
	handler: Box<dyn EventHandler>,
	watch_points: HashMap<PathBuf, Box<WatchPointCtx>>,
}

struct ApcWaker(HANDLE);

// SAFETY: QueueUserAPC is documented as callable from any thread targeting a
// thread handle obtained elsewhere; the handle here is a dedicated
// duplicate owned solely by this waker.
unsafe impl Send for ApcWaker {}
unsafe impl Sync for ApcWaker {}

impl Wake for ApcWaker {
	fn wake(&self) {
		unsafe {
			QueueUserAPC(Some(noop_apc), self.0, 0);
		}
	}
}

impl Drop for ApcWaker {
	fn drop(&mut self) {
		unsafe {
			CloseHandle(self.0);
		}
	}
}

unsafe extern "system" fn noop_apc(_data: usize) {}

fn encode_wide(path: &std::path::Path) -> Vec<u16> {
	path.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

pub(super) fn run(
	config: Config,
	handler: Box<dyn EventHandler>,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	// §3 "Windows-only: watcher thread handle with elevated priority" —
	// raise this thread above normal so directory-change completions aren't
	// starved by the rest of the host process.
	unsafe {
		SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL);
	}

	// The pseudo-handle from GetCurrentThread() is only valid for the
	// calling thread's own use; QueueUserAPC needs a real handle other
	// threads can target, so duplicate it into one.
	let mut real_handle: HANDLE = 0;
	let duplicated = unsafe {
		DuplicateHandle(
			GetCurrentProcess(),
			GetCurrentThread(),
			GetCurrentProcess(),
			&mut real_handle,
			0,
			0,
			DUPLICATE_SAME_ACCESS,
		)
	};
	if duplicated == 0 {
		signal_startup(
			&handshake,
			Err(format!(
				"DuplicateHandle for watcher thread failed: {}",
				std::io::Error::last_os_error()
			)),
		);
		return;
	}

	*waker_slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(ApcWaker(real_handle)));
	signal_startup(&handshake, Ok(()));
	debug!("windows backend started");

	let mut shared = Box::new(Shared {
		handler,
		watch_points: HashMap::new(),
	});
	let mut terminated = false;

	while !terminated {
		let wait_result = unsafe { SleepEx(u32::MAX, 1) };
		trace!(
			io_completion = wait_result == WAIT_IO_COMPLETION,
			"alertable wait returned"
		);
		terminated = drain_commands(&config, &mut shared, &commands);
	}

	shutdown(&mut shared);
	debug!("windows backend stopped");
}

/// Drains every pending command. Returns `true` once `Terminate` has been
/// observed (§4.6).
fn drain_commands(config: &Config, shared: &mut Box<Shared>, commands: &Receiver<Command>) -> bool {
	loop {
		match commands.try_recv() {
			Ok(Command::Register { paths, reply }) => {
				reply.complete(register(config, shared, paths));
			}
			Ok(Command::Unregister { paths, reply }) => {
				reply.complete(Ok(unregister(shared, paths)));
			}
			Ok(Command::Terminate { reply }) => {
				reply.complete(Ok(()));
				return true;
			}
			Err(TryRecvError::Empty) => return false,
			Err(TryRecvError::Disconnected) => return true,
		}
	}
}

fn register(config: &Config, shared: &mut Box<Shared>, paths: Vec<PathBuf>) -> crate::error::Result<()> {
	for path in &paths {
		require_absolute(path)?;
		if !path.is_dir() {
			return Err(WatchError::registration(path.clone(), "not a directory"));
		}
		if shared.watch_points.contains_key(path) {
			return Err(WatchError::registration(path.clone(), "already watching"));
		}
	}

	for path in paths {
		if let Err(err) = arm(config, shared, path.clone()) {
			return Err(err);
		}
	}
	Ok(())
}

/// Opens the directory handle and arms the first overlapped read for `path`
/// (§4.4 "Per-watch-point arming"). Inserts the resulting context into
/// `shared.watch_points` on success.
fn arm(config: &Config, shared: &mut Box<Shared>, path: PathBuf) -> crate::error::Result<()> {
	let native = to_extended_length(&path.to_string_lossy());
	let wide = encode_wide(std::path::Path::new(&native));

	let handle = unsafe {
		CreateFileW(
			wide.as_ptr(),
			FILE_LIST_DIRECTORY,
			FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
			std::ptr::null(),
			OPEN_EXISTING,
			FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
			0,
		)
	};
	if handle == INVALID_HANDLE_VALUE {
		return Err(WatchError::registration(
			path,
			format!("CreateFileW failed: {}", std::io::Error::last_os_error()),
		));
	}

	let mut ctx = Box::new(WatchPointCtx {
		report_root: path.clone(),
		handle,
		buffer: vec![0u8; config.clamped_buffer_size() as usize],
		state: WatchPointState::NotListening,
		shared: shared.as_mut() as *mut Shared,
	});

	if let Err(err) = arm_read(&mut ctx) {
		unsafe {
			CloseHandle(handle);
		}
		return Err(WatchError::registration(path, err));
	}

	shared.watch_points.insert(path, ctx);
	Ok(())
}

/// Issues one overlapped `ReadDirectoryChangesW` on `ctx`. The completion
/// routine re-arms the next read itself, so this is called once at
/// registration and once per completed batch (§4.4 "Success with data ...
/// Then rearm the watch point").
fn arm_read(ctx: &mut WatchPointCtx) -> Result<(), String> {
	let overlapped: Box<OVERLAPPED> = Box::new(unsafe { std::mem::zeroed() });
	let overlapped_ptr = Box::into_raw(overlapped);
	unsafe {
		(*overlapped_ptr).hEvent = ctx as *mut WatchPointCtx as HANDLE;
	}

	let ok = unsafe {
		ReadDirectoryChangesW(
			ctx.handle,
			ctx.buffer.as_mut_ptr() as *mut c_void,
			ctx.buffer.len() as u32,
			1, // bWatchSubtree = TRUE
			notify_filter(),
			std::ptr::null_mut(),
			overlapped_ptr,
			Some(completion_routine),
		)
	};

	if ok == 0 {
		let err = std::io::Error::last_os_error();
		unsafe {
			drop(Box::from_raw(overlapped_ptr));
		}
		return Err(format!("ReadDirectoryChangesW failed: {err}"));
	}

	ctx.state = WatchPointState::Listening;
	Ok(())
}

fn unregister(shared: &mut Box<Shared>, paths: Vec<PathBuf>) -> bool {
	let mut all_present = true;
	for path in paths {
		match shared.watch_points.get_mut(&path) {
			Some(ctx) => {
				ctx.state = WatchPointState::Cancelled;
				let cancelled = unsafe { CancelIoEx(ctx.handle, std::ptr::null()) };
				if cancelled == 0 {
					let err = std::io::Error::last_os_error();
					// ERROR_NOT_FOUND: no I/O was outstanding to cancel, a common
					// race with a read that already completed (§4.4 "Cancellation").
					if err.raw_os_error() != Some(windows_sys::Win32::Foundation::ERROR_NOT_FOUND as i32) {
						warn!(?path, %err, "CancelIoEx failed");
					}
				}
			}
			None => all_present = false,
		}
	}
	all_present
}

/// Runs on the watcher thread as an APC delivered while it's inside
/// `SleepEx`. Every completion for every watch point funnels through here
/// (§4.4 "Completion routine").
unsafe extern "system" fn completion_routine(
	error_code: u32,
	bytes_transferred: u32,
	overlapped: *mut OVERLAPPED,
) {
	let overlapped = Box::from_raw(overlapped);
	let ctx_ptr = overlapped.hEvent as *mut WatchPointCtx;
	let ctx = &mut *ctx_ptr;
	let shared = &mut *ctx.shared;

	if error_code == ERROR_OPERATION_ABORTED {
		finish(shared, ctx);
		return;
	}

	if error_code == 0 && bytes_transferred == 0 {
		let root = ctx.report_root.clone();
		shared
			.handler
			.handle_event(Ok(Event::new(ChangeType::Invalidated, root)));
		finish(shared, ctx);
		return;
	}

	if error_code == ERROR_ACCESS_DENIED {
		let root = ctx.report_root.clone();
		shared
			.handler
			.handle_event(Ok(Event::new(ChangeType::Removed, root)));
		finish(shared, ctx);
		return;
	}

	if error_code != 0 {
		shared.handler.handle_event(Err(WatchError::EventDecode(format!(
			"ReadDirectoryChangesW completion failed with {error_code}"
		))));
		finish(shared, ctx);
		return;
	}

	for event in decode_notifications(&ctx.buffer, &ctx.report_root) {
		shared.handler.handle_event(Ok(event));
	}

	if let Err(err) = arm_read(ctx) {
		shared.handler.handle_event(Err(WatchError::EventDecode(err)));
		finish(shared, ctx);
	}
}

/// Tears down a watch point that has reached a terminal completion: closes
/// its handle, marks it `FINISHED`, and removes it from the map.
fn finish(shared: &mut Shared, ctx: &mut WatchPointCtx) {
	ctx.state = WatchPointState::Finished;
	unsafe {
		CloseHandle(ctx.handle);
	}
	shared.watch_points.remove(&ctx.report_root);
}

/// Walks the `NextEntryOffset` chain of `FILE_NOTIFY_INFORMATION` records in
/// `buffer`, translating each into a normalized [`Event`] rooted at `root`
/// (§4.4 "Success with data").
fn decode_notifications(buffer: &[u8], root: &std::path::Path) -> Vec<Event> {
	let mut events = Vec::new();
	let mut offset = 0usize;
	loop {
		if offset + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() > buffer.len() {
			break;
		}
		let entry = unsafe { &*(buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION) };
		let name_len_bytes = entry.FileNameLength as usize;
		let name_ptr = unsafe { entry.FileName.as_ptr() };
		let name_units = name_len_bytes / 2;
		let wide_name = unsafe { std::slice::from_raw_parts(name_ptr, name_units) };
		// `report_root` is the path the caller originally registered, never
		// long-path-rewritten (that rewrite happens only for the native
		// `CreateFileW` call in `arm`), so no prefix-stripping is needed here
		// (§4.4 "Path construction").
		let name = String::from_utf16_lossy(wide_name);
		let path = join_record(root, name);

		events.push(Event::new(translate_action(entry.Action), path));

		if entry.NextEntryOffset == 0 {
			break;
		}
		offset += entry.NextEntryOffset as usize;
	}
	events
}

/// Translates a raw `FILE_NOTIFY_INFORMATION::Action` value (§4.4 "Success
/// with data").
fn translate_action(action: u32) -> ChangeType {
	match action {
		FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => ChangeType::Created,
		FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => ChangeType::Removed,
		FILE_ACTION_MODIFIED => ChangeType::Modified,
		_ => ChangeType::Unknown,
	}
}

/// §5 "close() performs best-effort cancellation: on Windows, waits one APC
/// cycle". Cancels every still-live watch point, then alternates short
/// alertable sleeps with command draining so their completion routines (and
/// any late command) get a chance to run, up to [`SHUTDOWN_DRAIN_BUDGET`].
fn shutdown(shared: &mut Box<Shared>) {
	for ctx in shared.watch_points.values_mut() {
		if ctx.state.is_live() {
			ctx.state = WatchPointState::Cancelled;
			unsafe {
				CancelIoEx(ctx.handle, std::ptr::null());
			}
		}
	}

	let started = Instant::now();
	while !shared.watch_points.is_empty() && started.elapsed() < SHUTDOWN_DRAIN_BUDGET {
		unsafe {
			SleepEx(0, 1);
		}
	}

	if !shared.watch_points.is_empty() {
		warn!(
			remaining = shared.watch_points.len(),
			"some watch points did not confirm cancellation within the shutdown budget"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn translates_added_and_renamed_new_as_created() {
		assert_eq!(translate_action(FILE_ACTION_ADDED), ChangeType::Created);
		assert_eq!(
			translate_action(FILE_ACTION_RENAMED_NEW_NAME),
			ChangeType::Created
		);
	}

	#[test]
	fn translates_removed_and_renamed_old_as_removed() {
		assert_eq!(translate_action(FILE_ACTION_REMOVED), ChangeType::Removed);
		assert_eq!(
			translate_action(FILE_ACTION_RENAMED_OLD_NAME),
			ChangeType::Removed
		);
	}

	#[test]
	fn translates_modified() {
		assert_eq!(translate_action(FILE_ACTION_MODIFIED), ChangeType::Modified);
	}

	#[test]
	fn unrecognized_action_is_unknown() {
		assert_eq!(translate_action(0xFFFF), ChangeType::Unknown);
	}
}
