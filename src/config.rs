//! In-process configuration surface.
//!
//! There is no persisted state, no configuration file, and no environment
//! variable consumed by the core (§6): a [`Config`] is built in memory by the
//! embedder and passed by value at construction. Knobs that don't apply to
//! the host platform are accepted and ignored rather than rejected, so a
//! caller can write one `Config` literal regardless of target.

use std::time::Duration;

/// Smallest accepted Windows overlapped-read buffer.
pub const MIN_BUFFER_SIZE_BYTES: u32 = 4 * 1024;
/// Largest accepted Windows overlapped-read buffer (overflow-prevention mode).
pub const MAX_BUFFER_SIZE_BYTES: u32 = 16 * 1024 * 1024;
/// Default Windows overlapped-read buffer.
pub const DEFAULT_BUFFER_SIZE_BYTES: u32 = 16 * 1024;

/// Construction-time configuration for a [`crate::WatchServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	/// Bound on how long `submit()` waits for a command to complete, on
	/// every platform.
	pub command_timeout: Duration,
	/// FSEvents coalescing latency. Ignored on platforms other than macOS.
	pub latency: Duration,
	/// Per-watch-point overlapped read buffer size. Ignored on platforms
	/// other than Windows. Clamped to
	/// `[MIN_BUFFER_SIZE_BYTES, MAX_BUFFER_SIZE_BYTES]`.
	pub buffer_size_bytes: u32,
}

impl Config {
	/// Returns `buffer_size_bytes` clamped to the documented range.
	pub fn clamped_buffer_size(&self) -> u32 {
		self.buffer_size_bytes.clamp(MIN_BUFFER_SIZE_BYTES, MAX_BUFFER_SIZE_BYTES)
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			command_timeout: Duration::from_secs(5),
			latency: Duration::from_millis(50),
			buffer_size_bytes: DEFAULT_BUFFER_SIZE_BYTES,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clamps_buffer_size_to_documented_range() {
		let mut config = Config::default();
		config.buffer_size_bytes = 1;
		assert_eq!(config.clamped_buffer_size(), MIN_BUFFER_SIZE_BYTES);

		config.buffer_size_bytes = u32::MAX;
		assert_eq!(config.clamped_buffer_size(), MAX_BUFFER_SIZE_BYTES);

		config.buffer_size_bytes = 32 * 1024;
		assert_eq!(config.clamped_buffer_size(), 32 * 1024);
	}
}
