//! The normalized event model delivered to [`crate::EventHandler`].

use std::path::PathBuf;

/// The kind of change a normalized [`Event`] describes.
///
/// The discriminants are wire-stable: a host-language bridge may forward the
/// ordinal directly instead of re-deriving it. `-1` is reserved by the
/// external test harness for error-carrying records and is intentionally not
/// a variant here — failures travel through `Result<Event, WatchError>`
/// instead of being folded into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ChangeType {
	/// A file or directory was created, or a move landed a path into a
	/// watched root.
	Created = 0,
	/// A file or directory was removed, or a move took a path out of a
	/// watched root.
	Removed = 1,
	/// Contents, attributes, or metadata of a watched path changed.
	Modified = 2,
	/// The watched root itself was moved, deleted, or its volume was
	/// unmounted; the watch point is no longer usable.
	Invalidated = 3,
	/// A native event whose flags could not be mapped to any other variant.
	Unknown = 4,
	/// The OS dropped change records (kernel queue full, must-scan-subdirs,
	/// or a zero-byte completion); no partial event list is implied.
	Overflow = 5,
}

/// A single normalized change, paired with the absolute path it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	/// What kind of change occurred.
	pub kind: ChangeType,
	/// Absolute path in host encoding. Never empty.
	pub path: PathBuf,
}

impl Event {
	/// Construct a new event record.
	pub fn new(kind: ChangeType, path: impl Into<PathBuf>) -> Self {
		Self {
			kind,
			path: path.into(),
		}
	}
}
