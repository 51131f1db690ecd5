//! Crate-wide error taxonomy.
//!
//! Mirrors the scopes called out in the spec: startup errors are propagated
//! synchronously to the caller of [`crate::WatchServer::start`], everything
//! else reaches the embedder asynchronously through the [`crate::EventHandler`]
//! sink.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WatchError>;

/// A typed failure raised by the watch server.
///
/// Variants correspond to the error taxonomy in the specification: startup,
/// registration, per-root runtime, per-event runtime, and shutdown failures.
#[derive(Debug, Error)]
pub enum WatchError {
	/// A native OS primitive could not be initialized (e.g. `inotify_init`,
	/// `FSEventStreamCreate`, or the Windows wakeup semaphore). Fatal to the
	/// server: propagated synchronously to `start()`.
	#[error("failed to initialize watch backend: {0}")]
	Startup(String),

	/// `startWatching`/`stopWatching` was asked to operate on a path that
	/// cannot be registered: not absolute, not a directory, or a duplicate.
	#[error("cannot watch {path}: {reason}")]
	Registration {
		/// The offending path.
		path: PathBuf,
		/// Human-readable reason.
		reason: String,
	},

	/// A registered root stopped being watchable at runtime (deleted, mount
	/// lost, OS-level overflow). Not fatal to the server; the affected watch
	/// point transitions to `FINISHED` and the embedder must re-register if
	/// it wants to keep watching that root.
	#[error("watch root {path} became unwatchable: {reason}")]
	RootLost {
		/// The root that was lost.
		path: PathBuf,
		/// Human-readable reason.
		reason: String,
	},

	/// A single native event record could not be decoded (unrecognized flag
	/// combination, malformed buffer). Never fatal.
	#[error("failed to decode a native event: {0}")]
	EventDecode(String),

	/// The watcher thread did not exit within the shutdown budget.
	#[error("watcher thread failed to shut down within the timeout")]
	ShutdownTimeout,

	/// A command was not completed within `commandTimeoutInMillis`.
	#[error("command timed out after {0:?}")]
	CommandTimeout(std::time::Duration),

	/// The server has already been closed; no further commands are accepted.
	#[error("watch server is terminated")]
	Terminated,

	/// Wraps an I/O failure from the platform backend (inotify reads,
	/// Windows file handles, etc).
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl WatchError {
	pub(crate) fn registration(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
		Self::Registration {
			path: path.into(),
			reason: reason.into(),
		}
	}

	pub(crate) fn root_lost(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
		Self::RootLost {
			path: path.into(),
			reason: reason.into(),
		}
	}
}
