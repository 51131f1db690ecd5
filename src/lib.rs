//! Cross-platform file-system change notification engine.
//!
//! [`WatchServer`] owns a single background thread per instance and
//! multiplexes an arbitrary number of watched directory roots over the
//! native watching primitive for the host platform: inotify on Linux,
//! FSEvents on macOS, `ReadDirectoryChangesW` on Windows. Callers never
//! touch the native API directly; all registration and teardown goes
//! through a bounded command channel, and normalized [`Event`]s come back
//! through an [`EventHandler`].
//!
//! ```no_run
//! use fswatch_core::{Config, Event, WatchServer};
//!
//! let server = WatchServer::start(Config::default(), |event: Result<Event, _>| {
//!     if let Ok(event) = event {
//!         println!("{:?} {:?}", event.kind, event.path);
//!     }
//! })?;
//! server.start_watching(vec!["/tmp/watched".into()])?;
//! # Ok::<(), fswatch_core::WatchError>(())
//! ```

mod command;
mod config;
mod error;
mod event;
mod path;
mod platform;
mod server;
mod sink;
mod watch_point;

pub use config::{Config, DEFAULT_BUFFER_SIZE_BYTES, MAX_BUFFER_SIZE_BYTES, MIN_BUFFER_SIZE_BYTES};
pub use error::{Result, WatchError};
pub use event::{ChangeType, Event};
pub use server::WatchServer;
pub use sink::EventHandler;
