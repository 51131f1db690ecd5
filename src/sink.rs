//! The Event Sink interface (§6): the contract the core uses to deliver
//! change events and errors to the host.

use crate::error::WatchError;
use crate::event::Event;

/// Receives normalized events and errors from the watcher thread.
///
/// Implementations are invoked only from the watcher thread (§4.1), so a
/// single `&mut self` is sufficient; no internal synchronization is required
/// by the handler itself.
///
/// # Example
///
/// ```
/// use fswatch_core::{Event, EventHandler, WatchError};
///
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn handle_event(&mut self, event: Result<Event, WatchError>) {
///         match event {
///             Ok(event) => println!("event: {event:?}"),
///             Err(err) => eprintln!("watch error: {err}"),
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + 'static {
	/// Handles one normalized event, or a failure record (§7).
	fn handle_event(&mut self, event: Result<Event, WatchError>);
}

impl<F> EventHandler for F
where
	F: FnMut(Result<Event, WatchError>) + Send + 'static,
{
	fn handle_event(&mut self, event: Result<Event, WatchError>) {
		(self)(event)
	}
}

impl EventHandler for std::sync::mpsc::Sender<Result<Event, WatchError>> {
	fn handle_event(&mut self, event: Result<Event, WatchError>) {
		// The receiver may have been dropped (e.g. the host already gave up on
		// the stream); dropping the event here is intentional, not a bug -
		// there's nothing left to report a send failure to.
		let _ = self.send(event);
	}
}
