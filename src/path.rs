//! Bidirectional conversion between host-supplied path strings and the
//! server's canonical on-disk representation (§4.5).
//!
//! The long-path rewrite is pure string manipulation and is therefore
//! exercised by unit tests on every host platform, not just Windows.

use std::path::{Path, PathBuf};

use crate::error::{Result, WatchError};

/// Windows lifts the 260-character `MAX_PATH` limit for paths carrying the
/// `\\?\` (drive-letter) or `\\?\UNC\` (UNC) prefix. Paths longer than this
/// many UTF-16 units are rewritten to carry that prefix.
const LONG_PATH_THRESHOLD: usize = 240;

const WIN32_LONG_PATH_PREFIX: &str = r"\\?\";
const WIN32_LONG_UNC_PREFIX: &str = r"\\?\UNC\";

/// Validates that `path` is absolute and returns it unchanged.
///
/// Per §4.5, relative paths are rejected outright with
/// [`WatchError::Registration`]; this crate never resolves a watch root
/// against the process's current directory.
pub fn require_absolute(path: &Path) -> Result<&Path> {
	if path.is_absolute() {
		Ok(path)
	} else {
		Err(WatchError::registration(path, "path must be absolute"))
	}
}

/// Rewrites `path` into the Windows extended-length form when its length
/// exceeds [`LONG_PATH_THRESHOLD`] and it isn't already using one of the
/// long-path prefixes.
///
/// `A-Za-z:\` (drive-letter) paths get the `\\?\` prefix; `\\server\share`
/// (UNC) paths get `\\?\UNC\` with the leading `\\` stripped. Paths already
/// carrying `\\?\` or `\\?\UNC\`, and paths shorter than the threshold, are
/// returned unchanged. This is plain string manipulation: it encodes
/// Windows' own path syntax rules, not anything platform-specific about the
/// host running the code, so it is safe to apply (and test) unconditionally.
pub fn to_extended_length(path: &str) -> String {
	if path.len() <= LONG_PATH_THRESHOLD {
		return path.to_string();
	}
	if path.starts_with(WIN32_LONG_PATH_PREFIX) {
		return path.to_string();
	}
	if let Some(unc_tail) = path.strip_prefix(r"\\") {
		return format!("{WIN32_LONG_UNC_PREFIX}{unc_tail}");
	}
	if is_drive_letter_path(path) {
		return format!("{WIN32_LONG_PATH_PREFIX}{path}");
	}
	path.to_string()
}

/// Strips a Windows extended-length prefix back to the conventional form a
/// host caller registered, the inverse of [`to_extended_length`]. Used when
/// reporting event paths reconstructed from a long-path-rewritten root.
pub fn strip_extended_length(path: &str) -> String {
	if let Some(unc_tail) = path.strip_prefix(WIN32_LONG_UNC_PREFIX) {
		return format!(r"\\{unc_tail}");
	}
	if let Some(tail) = path.strip_prefix(WIN32_LONG_PATH_PREFIX) {
		return tail.to_string();
	}
	path.to_string()
}

fn is_drive_letter_path(path: &str) -> bool {
	let bytes = path.as_bytes();
	bytes.len() >= 3
		&& bytes[0].is_ascii_alphabetic()
		&& bytes[1] == b':'
		&& bytes[2] == b'\\'
}

/// Joins a watch point's canonical root with a record's raw file name,
/// producing the absolute path reported to the sink (§4.2 step 4, §4.4 "Path
/// construction").
pub fn join_record(root: &Path, name: impl AsRef<Path>) -> PathBuf {
	root.join(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_relative_paths() {
		assert!(require_absolute(Path::new("relative/path")).is_err());
	}

	#[test]
	fn accepts_absolute_paths() {
		let abs = if cfg!(windows) { r"C:\abs\path" } else { "/abs/path" };
		assert!(require_absolute(Path::new(abs)).is_ok());
	}

	#[test]
	fn short_paths_are_untouched() {
		let short = r"C:\Users\a\short.txt";
		assert_eq!(to_extended_length(short), short);
	}

	#[test]
	fn long_drive_letter_path_gets_prefixed() {
		let long = format!(r"C:\{}", "a".repeat(250));
		let rewritten = to_extended_length(&long);
		assert!(rewritten.starts_with(WIN32_LONG_PATH_PREFIX));
		assert_eq!(strip_extended_length(&rewritten), long);
	}

	#[test]
	fn long_unc_path_gets_unc_prefix() {
		let long = format!(r"\\server\share\{}", "a".repeat(250));
		let rewritten = to_extended_length(&long);
		assert!(rewritten.starts_with(WIN32_LONG_UNC_PREFIX));
		assert_eq!(strip_extended_length(&rewritten), long);
	}

	#[test]
	fn already_prefixed_paths_are_idempotent() {
		let long = format!(r"C:\{}", "a".repeat(250));
		let once = to_extended_length(&long);
		let twice = to_extended_length(&once);
		assert_eq!(once, twice);
	}
}
