//! macOS backend (§4.3): a single `FSEventStream` covering every registered
//! root, run on a dedicated `CFRunLoop` that lives entirely on the watcher
//! thread. Because `FSEventStreamCreate` takes its path list up front, adding
//! or removing a root rebuilds the stream rather than mutating it in place —
//! this is the "transiently `Listening -> NotListening -> Listening`" case
//! the watch point state machine documents.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use core_foundation::array::CFArray;
use core_foundation::base::TCFType;
use core_foundation::runloop::CFRunLoop;
use core_foundation::string::CFString;
use core_foundation_sys::base::Boolean;
use core_foundation_sys::runloop::{
	kCFRunLoopDefaultMode, kCFRunLoopRunStopped, kCFRunLoopRunTimedOut, CFRunLoopAddSource,
	CFRunLoopGetCurrent, CFRunLoopRef, CFRunLoopRunInMode, CFRunLoopSourceContext,
	CFRunLoopSourceCreate, CFRunLoopSourceRef, CFRunLoopSourceSignal, CFRunLoopWakeUp,
};
use fsevent_sys::core_foundation as cf;
use fsevent_sys::fsevent as fe;
use tracing::{debug, trace, warn};

bitflags::bitflags! {
	/// Typed wrapper around the raw `FSEventStreamEventFlags` bitfield, so
	/// translation logic reads as flag tests rather than bare integer masking.
	/// Grounded on the same `bitflags!` block over `fsevent_sys` constants used
	/// in `vercel-turborepo/crates/turborepo-filewatch/src/fsevent.rs`.
	#[repr(C)]
	struct StreamFlags: fe::FSEventStreamEventFlags {
		const MUST_SCAN_SUBDIRS = fe::kFSEventStreamEventFlagMustScanSubDirs;
		const ROOT_CHANGED = fe::kFSEventStreamEventFlagRootChanged;
		const MOUNT = fe::kFSEventStreamEventFlagMount;
		const UNMOUNT = fe::kFSEventStreamEventFlagUnmount;
		const HISTORY_DONE = fe::kFSEventStreamEventFlagHistoryDone;
		const ITEM_CREATED = fe::kFSEventStreamEventFlagItemCreated;
		const ITEM_REMOVED = fe::kFSEventStreamEventFlagItemRemoved;
		const ITEM_MODIFIED = fe::kFSEventStreamEventFlagItemModified;
		const ITEM_RENAMED = fe::kFSEventStreamEventFlagItemRenamed;
		const ITEM_INODE_META_MOD = fe::kFSEventStreamEventFlagItemInodeMetaMod;
		const ITEM_FINDER_INFO_MOD = fe::kFSEventStreamEventFlagItemFinderInfoMod;
		const ITEM_CHANGE_OWNER = fe::kFSEventStreamEventFlagItemChangeOwner;
		const ITEM_XATTR_MOD = fe::kFSEventStreamEventFlagItemXattrMod;
	}
}

use crate::command::{Command, Wake};
use crate::config::Config;
use crate::error::WatchError;
use crate::event::{ChangeType, Event};
use crate::path::require_absolute;
use crate::sink::EventHandler;
use crate::watch_point::{HistoryState, WatchPointState};

use super::{signal_startup, StartupHandshake, WakerSlot};

/// How long each `CFRunLoopRunInMode` turn blocks for before returning to
/// check the command queue, when no external wake has arrived. Pure
/// backstop: the common path is woken immediately by [`RunLoopWaker`].
const RUN_LOOP_POLL_INTERVAL: f64 = 1.0;

struct RootEntry {
	state: WatchPointState,
	history: HistoryState,
}

/// Sentinel meaning "never started a stream before"; the first stream this
/// server ever opens starts `kFSEventStreamEventIdSinceNow` rather than
/// resuming from a prior ID.
type LastSeenEventId = Option<fe::FSEventStreamEventId>;

/// Wakes the watcher thread's run loop from any other thread by signalling a
/// no-op `CFRunLoopSource` and calling `CFRunLoopWakeUp`.
struct RunLoopWaker {
	run_loop: CFRunLoop,
	source: CFRunLoopSourceRef,
}

// SAFETY: every CFRunLoop function used here is documented as safe to call
// from any thread; the ref types are opaque CF object pointers.
unsafe impl Send for RunLoopWaker {}
unsafe impl Sync for RunLoopWaker {}

impl Wake for RunLoopWaker {
	fn wake(&self) {
		unsafe {
			CFRunLoopSourceSignal(self.source);
			CFRunLoopWakeUp(self.run_loop.as_concrete_TypeRef() as CFRunLoopRef);
		}
	}
}

extern "C" fn noop_perform(_info: *mut c_void) {}
extern "C" fn noop_equal(_a: *const c_void, _b: *const c_void) -> Boolean {
	0
}

/// State shared between the watcher thread and the FSEvents callback. Both
/// run on the same OS thread (the callback fires synchronously inside
/// `CFRunLoopRunInMode`), so plain field access is sound without locking.
struct StreamState {
	roots: HashMap<PathBuf, RootEntry>,
	handler: Box<dyn EventHandler>,
	/// Highest FSEvents stream ID processed so far; `None` until the first
	/// event of the server's lifetime arrives. Used to resume a rebuilt
	/// stream from where the last one left off (§3, §4.3 step 5).
	last_seen_event_id: LastSeenEventId,
	/// Set once `kFSEventStreamEventFlagHistoryDone` has been observed on
	/// the current stream; promotes every `New` root to `Historical` (§4.3
	/// step 3).
	finished_processing_historical: bool,
	/// Set by the FSEvents callback when a root was just invalidated and
	/// dropped from `roots`. The callback itself cannot rebuild the stream
	/// (it has no access to `active_stream`/`Config`, which live on `run`'s
	/// stack), so `run` checks this after every `CFRunLoopRunInMode` turn and
	/// performs the rebuild there — otherwise the invalidated path stays in
	/// the stream's immutable `CFArray` forever and the OS keeps delivering
	/// records for it that `find_root` can now only silently drop.
	needs_rebuild: bool,
}

pub(super) fn run(
	config: Config,
	handler: Box<dyn EventHandler>,
	commands: Receiver<Command>,
	waker_slot: WakerSlot,
	handshake: StartupHandshake,
) {
	let run_loop = CFRunLoop::get_current();

	let mut source_context = CFRunLoopSourceContext {
		version: 0,
		info: std::ptr::null_mut(),
		retain: None,
		release: None,
		copyDescription: None,
		equal: Some(noop_equal),
		hash: None,
		schedule: None,
		cancel: None,
		perform: noop_perform,
	};
	let wake_source = unsafe { CFRunLoopSourceCreate(std::ptr::null_mut(), 0, &mut source_context) };
	if wake_source.is_null() {
		signal_startup(&handshake, Err("CFRunLoopSourceCreate failed".into()));
		return;
	}
	unsafe {
		CFRunLoopAddSource(
			run_loop.as_concrete_TypeRef() as CFRunLoopRef,
			wake_source,
			kCFRunLoopDefaultMode,
		);
	}

	*waker_slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(RunLoopWaker {
		run_loop: run_loop.clone(),
		source: wake_source,
	}));
	signal_startup(&handshake, Ok(()));
	debug!("macos backend started");

	let mut state = Box::new(StreamState {
		roots: HashMap::new(),
		handler,
		last_seen_event_id: None,
		finished_processing_historical: false,
		needs_rebuild: false,
	});
	let mut active_stream: Option<fe::FSEventStreamRef> = None;
	let mut terminated = false;

	while !terminated {
		let run_result = unsafe {
			CFRunLoopRunInMode(
				kCFRunLoopDefaultMode,
				RUN_LOOP_POLL_INTERVAL,
				0, // returnAfterSourceHandled = false
			)
		};
		match run_result {
			r if r == kCFRunLoopRunStopped => trace!("run loop stopped"),
			r if r == kCFRunLoopRunTimedOut => trace!("run loop poll interval elapsed"),
			_ => trace!(run_result, "run loop turn completed"),
		}

		if std::mem::take(&mut state.needs_rebuild) {
			if rebuild_stream(&config, &mut state, &mut active_stream).is_err() {
				warn!("failed to rebuild FSEventStream after a root was invalidated");
			}
		}

		loop {
			match commands.try_recv() {
				Ok(Command::Register { paths, reply }) => {
					reply.complete(register(&config, &mut state, &mut active_stream, paths));
				}
				Ok(Command::Unregister { paths, reply }) => {
					reply.complete(Ok(unregister(
						&config,
						&mut state,
						&mut active_stream,
						paths,
					)));
				}
				Ok(Command::Terminate { reply }) => {
					reply.complete(Ok(()));
					terminated = true;
					break;
				}
				Err(TryRecvError::Empty) => break,
				Err(TryRecvError::Disconnected) => {
					terminated = true;
					break;
				}
			}
		}
	}

	if let Some(stream) = active_stream.take() {
		stop_stream(stream);
	}
	debug!("macos backend stopped");
}

fn register(
	config: &Config,
	state: &mut Box<StreamState>,
	active_stream: &mut Option<fe::FSEventStreamRef>,
	paths: Vec<PathBuf>,
) -> crate::error::Result<()> {
	for path in &paths {
		require_absolute(path)?;
		if !path.is_dir() {
			return Err(WatchError::registration(path.clone(), "not a directory"));
		}
		if state.roots.contains_key(path) {
			return Err(WatchError::registration(path.clone(), "already watching"));
		}
	}

	// §4.3 step 3: a root is tagged `New` (its replay window must be
	// suppressed until `HistoryDone`) precisely when the stream it joins is
	// about to resume from `SinceNow` — i.e. this server has never seen an
	// event before. A root added to an already-resumed stream starts
	// `Historical`: the stream's replay window, if any, has already closed.
	let history = if state.last_seen_event_id.is_none() {
		HistoryState::New
	} else {
		HistoryState::Historical
	};
	for path in &paths {
		state.roots.insert(
			path.clone(),
			RootEntry {
				state: WatchPointState::NotListening,
				history,
			},
		);
	}

	rebuild_stream(config, state, active_stream)
}

fn unregister(
	config: &Config,
	state: &mut Box<StreamState>,
	active_stream: &mut Option<fe::FSEventStreamRef>,
	paths: Vec<PathBuf>,
) -> bool {
	let mut all_present = true;
	for path in &paths {
		if state.roots.remove(path).is_none() {
			all_present = false;
		}
	}
	if rebuild_stream(config, state, active_stream).is_err() {
		warn!("failed to rebuild FSEventStream after unregister");
	}
	all_present
}

/// Tears down the current stream, if any, and creates a fresh one covering
/// every entry in `state.roots`. A no-op (stream released, nothing created)
/// when the root set is empty.
fn rebuild_stream(
	config: &Config,
	state: &mut Box<StreamState>,
	active_stream: &mut Option<fe::FSEventStreamRef>,
) -> crate::error::Result<()> {
	if let Some(stream) = active_stream.take() {
		stop_stream(stream);
	}
	for entry in state.roots.values_mut() {
		entry.state = WatchPointState::NotListening;
	}
	state.finished_processing_historical = false;

	if state.roots.is_empty() {
		return Ok(());
	}

	let since_id = state
		.last_seen_event_id
		.unwrap_or(fe::kFSEventStreamEventIdSinceNow);

	let cf_paths = state
		.roots
		.keys()
		.map(|path| CFString::new(&path.to_string_lossy()))
		.collect::<Vec<_>>();
	let cf_array = CFArray::from_CFTypes(&cf_paths);

	let mut context = fe::FSEventStreamContext {
		version: 0,
		info: state.as_mut() as *mut StreamState as *mut c_void,
		retain: None,
		release: None,
		copy_description: None,
	};

	let stream = unsafe {
		fe::FSEventStreamCreate(
			cf::kCFAllocatorDefault,
			fsevent_callback,
			&mut context,
			cf_array.as_concrete_TypeRef() as cf::CFArrayRef,
			since_id,
			config.latency.as_secs_f64(),
			fe::kFSEventStreamCreateFlagFileEvents
				| fe::kFSEventStreamCreateFlagWatchRoot
				| fe::kFSEventStreamCreateFlagNoDefer,
		)
	};
	if stream.is_null() {
		return Err(WatchError::Startup("FSEventStreamCreate failed".into()));
	}

	unsafe {
		fe::FSEventStreamScheduleWithRunLoop(
			stream,
			CFRunLoopGetCurrent() as *mut _ as cf::CFRunLoopRef,
			kCFRunLoopDefaultMode as *const _ as cf::CFStringRef,
		);
		if fe::FSEventStreamStart(stream) == 0 {
			fe::FSEventStreamInvalidate(stream);
			fe::FSEventStreamRelease(stream);
			return Err(WatchError::Startup("FSEventStreamStart failed".into()));
		}
	}

	for entry in state.roots.values_mut() {
		entry.state = WatchPointState::Listening;
	}
	*active_stream = Some(stream);
	Ok(())
}

fn stop_stream(stream: fe::FSEventStreamRef) {
	unsafe {
		fe::FSEventStreamStop(stream);
		fe::FSEventStreamInvalidate(stream);
		fe::FSEventStreamRelease(stream);
	}
}

extern "C" fn fsevent_callback(
	_stream_ref: fe::FSEventStreamRef,
	info: *mut c_void,
	num_events: usize,
	event_paths: *mut c_void,
	event_flags: *const fe::FSEventStreamEventFlags,
	event_ids: *const fe::FSEventStreamEventId,
) {
	// SAFETY: `info` is the `StreamState` pointer set in `rebuild_stream`,
	// valid for as long as the stream that is invoking us is scheduled.
	let state = unsafe { &mut *(info as *mut StreamState) };
	let paths = event_paths as *const *const c_char;

	for i in 0..num_events {
		let raw_path = unsafe { *paths.add(i) };
		let flags = StreamFlags::from_bits_truncate(unsafe { *event_flags.add(i) });
		let event_id = unsafe { *event_ids.add(i) };
		let path = match unsafe { CStr::from_ptr(raw_path) }.to_str() {
			Ok(s) => PathBuf::from(s),
			Err(err) => {
				trace!(?err, "non-utf8 path from FSEvents, skipping");
				continue;
			}
		};

		state.last_seen_event_id = Some(match state.last_seen_event_id {
			Some(current) if current >= event_id => current,
			_ => event_id,
		});

		if flags.contains(StreamFlags::HISTORY_DONE) {
			state.finished_processing_historical = true;
			for entry in state.roots.values_mut() {
				entry.history = HistoryState::Historical;
			}
			trace!("FSEvents history replay finished");
			continue;
		}

		handle_native_event(state, &path, flags, event_id);
	}
}

fn handle_native_event(
	state: &mut StreamState,
	path: &Path,
	flags: StreamFlags,
	event_id: fe::FSEventStreamEventId,
) {
	let Some(root) = find_root(state, path) else {
		trace!(?path, "event outside any registered root, ignoring");
		return;
	};

	if !state.finished_processing_historical {
		if let Some(entry) = state.roots.get(&root) {
			if entry.history == HistoryState::New {
				trace!(?path, "suppressing historical replay event for new root");
				return;
			}
		}
	}

	if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
		state
			.handler
			.handle_event(Ok(Event::new(ChangeType::Overflow, root)));
		return;
	}

	let root_changed = flags.contains(StreamFlags::ROOT_CHANGED) && event_id == 0;
	if root_changed || flags.intersects(StreamFlags::MOUNT | StreamFlags::UNMOUNT) {
		state
			.handler
			.handle_event(Ok(Event::new(ChangeType::Invalidated, root.clone())));
		state.roots.remove(&root);
		// The stream's CFArray is immutable; dropping `root` from `roots`
		// alone leaves FSEvents still delivering records for it. `run` rebuilds
		// the stream on its next turn, once the callback (and `CFRunLoopRunInMode`)
		// has returned.
		state.needs_rebuild = true;
		return;
	}

	let kind = translate_flags(flags);
	state.handler.handle_event(Ok(Event::new(kind, path.to_path_buf())));
}

fn find_root(state: &StreamState, path: &Path) -> Option<PathBuf> {
	state
		.roots
		.keys()
		.find(|root| path.starts_with(root))
		.cloned()
}

/// Translates a raw FSEvents flag set into a normalized [`ChangeType`],
/// following the priority order in §4.3 step 4 (first match wins).
///
/// `ItemRenamed` is the asymmetric half of a rename pair: FSEvents emits it
/// for both sides of a move, distinguished only by whether `ItemCreated` is
/// also set on that same record: `ItemRenamed | ItemCreated` maps to
/// `REMOVED`, `ItemRenamed` alone maps to `CREATED`.
fn translate_flags(flags: StreamFlags) -> ChangeType {
	if flags.contains(StreamFlags::ITEM_RENAMED) {
		return if flags.contains(StreamFlags::ITEM_CREATED) {
			ChangeType::Removed
		} else {
			ChangeType::Created
		};
	}
	if flags.contains(StreamFlags::ITEM_MODIFIED) {
		return ChangeType::Modified;
	}
	if flags.contains(StreamFlags::ITEM_REMOVED) {
		return ChangeType::Removed;
	}
	if flags.intersects(
		StreamFlags::ITEM_INODE_META_MOD
			| StreamFlags::ITEM_FINDER_INFO_MOD
			| StreamFlags::ITEM_CHANGE_OWNER
			| StreamFlags::ITEM_XATTR_MOD,
	) {
		return ChangeType::Modified;
	}
	if flags.contains(StreamFlags::ITEM_CREATED) {
		return ChangeType::Created;
	}
	ChangeType::Unknown
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::mpsc;

	#[test]
	fn translates_created_flag() {
		assert_eq!(translate_flags(StreamFlags::ITEM_CREATED), ChangeType::Created);
	}

	#[test]
	fn translates_removed_flag() {
		assert_eq!(translate_flags(StreamFlags::ITEM_REMOVED), ChangeType::Removed);
	}

	#[test]
	fn translates_modified_family_as_modified() {
		assert_eq!(translate_flags(StreamFlags::ITEM_MODIFIED), ChangeType::Modified);
		assert_eq!(translate_flags(StreamFlags::ITEM_XATTR_MOD), ChangeType::Modified);
	}

	#[test]
	fn renamed_without_created_is_the_new_name() {
		assert_eq!(translate_flags(StreamFlags::ITEM_RENAMED), ChangeType::Created);
	}

	#[test]
	fn renamed_with_created_is_the_old_name() {
		// §4.3 step 4: the asymmetric FSEvents rename pairing.
		assert_eq!(
			translate_flags(StreamFlags::ITEM_RENAMED | StreamFlags::ITEM_CREATED),
			ChangeType::Removed
		);
	}

	#[test]
	fn unrecognized_flags_are_unknown() {
		assert_eq!(translate_flags(StreamFlags::empty()), ChangeType::Unknown);
	}

	fn test_state(
		roots: impl IntoIterator<Item = (PathBuf, HistoryState)>,
		finished_processing_historical: bool,
	) -> (Box<StreamState>, mpsc::Receiver<crate::error::Result<Event>>) {
		let (tx, rx) = mpsc::channel();
		let roots = roots
			.into_iter()
			.map(|(path, history)| {
				(
					path,
					RootEntry {
						state: WatchPointState::Listening,
						history,
					},
				)
			})
			.collect();
		let state = Box::new(StreamState {
			roots,
			handler: Box::new(tx),
			last_seen_event_id: None,
			finished_processing_historical,
			needs_rebuild: false,
		});
		(state, rx)
	}

	// §4.3 step 3: events targeting a `New` root are discarded until
	// `HistoryDone` promotes it, so a freshly registered root doesn't replay
	// the stream's backlog as if it were live activity.
	#[test]
	fn suppresses_events_for_new_root_before_history_done() {
		let root = PathBuf::from("/tmp/watched");
		let (mut state, rx) = test_state([(root.clone(), HistoryState::New)], false);
		let path = root.join("file.txt");

		handle_native_event(&mut state, &path, StreamFlags::ITEM_CREATED, 1);

		assert!(rx.try_recv().is_err(), "historical replay event must be suppressed");
	}

	#[test]
	fn delivers_events_for_historical_root_even_before_history_done() {
		let root = PathBuf::from("/tmp/watched");
		let (mut state, rx) = test_state([(root.clone(), HistoryState::Historical)], false);
		let path = root.join("file.txt");

		handle_native_event(&mut state, &path, StreamFlags::ITEM_CREATED, 1);

		let event = rx.try_recv().expect("event should be delivered").expect("ok event");
		assert_eq!(event.kind, ChangeType::Created);
		assert_eq!(event.path, path);
	}

	#[test]
	fn delivers_events_once_history_done_is_finished() {
		let root = PathBuf::from("/tmp/watched");
		let (mut state, rx) = test_state([(root.clone(), HistoryState::New)], true);
		let path = root.join("file.txt");

		handle_native_event(&mut state, &path, StreamFlags::ITEM_CREATED, 1);

		let event = rx.try_recv().expect("event should be delivered").expect("ok event");
		assert_eq!(event.kind, ChangeType::Created);
	}

	// §4.3 step 4: `MustScanSubDirs` takes priority over every other flag and
	// maps to OVERFLOW for the affected root, not a removal of the watch
	// point (the client doesn't need to re-register, unlike RootChanged).
	#[test]
	fn must_scan_subdirs_emits_overflow_and_keeps_the_root_registered() {
		let root = PathBuf::from("/tmp/watched");
		let (mut state, rx) = test_state([(root.clone(), HistoryState::Historical)], true);

		handle_native_event(&mut state, &root, StreamFlags::MUST_SCAN_SUBDIRS, 5);

		let event = rx.try_recv().expect("event should be delivered").expect("ok event");
		assert_eq!(event.kind, ChangeType::Overflow);
		assert_eq!(event.path, root);
		assert!(state.roots.contains_key(&root));
		assert!(!state.needs_rebuild);
	}

	// §4.3 step 2 / §9: the stream's root array is immutable, so invalidating
	// a root must schedule a rebuild rather than only dropping it from the
	// in-memory map, or FSEvents keeps delivering records for it forever.
	#[test]
	fn root_changed_with_zero_event_id_emits_invalidated_and_schedules_rebuild() {
		let root = PathBuf::from("/tmp/watched");
		let (mut state, rx) = test_state([(root.clone(), HistoryState::Historical)], true);

		handle_native_event(&mut state, &root, StreamFlags::ROOT_CHANGED, 0);

		let event = rx.try_recv().expect("event should be delivered").expect("ok event");
		assert_eq!(event.kind, ChangeType::Invalidated);
		assert_eq!(event.path, root);
		assert!(!state.roots.contains_key(&root));
		assert!(state.needs_rebuild);
	}

	#[test]
	fn mount_and_unmount_invalidate_regardless_of_event_id() {
		let root = PathBuf::from("/tmp/watched");
		let (mut state, rx) = test_state([(root.clone(), HistoryState::Historical)], true);

		handle_native_event(&mut state, &root, StreamFlags::UNMOUNT, 42);

		let event = rx.try_recv().expect("event should be delivered").expect("ok event");
		assert_eq!(event.kind, ChangeType::Invalidated);
		assert!(state.needs_rebuild);
	}
}
