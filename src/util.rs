//! Small shared helpers

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::state::FileEntry;

/// Suffix appended to in-flight file writes. The scanner skips these.
pub const TMP_SUFFIX: &str = ".sync-tmp";

/// Current wall-clock time as seconds since the Unix epoch
pub fn now_ts() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Sibling temp file name for an atomic write (write here, then rename)
pub fn tmp_filename(path: &Path) -> PathBuf {
	let mut filepath = PathBuf::from(path);
	let mut filename = path.file_name().unwrap_or_default().to_os_string();
	filename.push(TMP_SUFFIX);
	filepath.set_file_name(filename);
	filepath
}

/// MD5 fingerprint of a byte slice as lowercase hex
pub fn md5_hex(data: &[u8]) -> String {
	format!("{:x}", md5::compute(data))
}

/// Check that a wire-supplied relative path is safe to join under a root.
///
/// Paths use `/` separators, must be non-empty, and may not contain empty,
/// `.` or `..` segments or an absolute prefix.
pub fn is_safe_rel_path(path: &str) -> bool {
	if path.is_empty() || path.starts_with('/') || path.contains('\\') {
		return false;
	}
	path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Digest over a file map, used as the `SYNC_COMPLETE` state fingerprint.
///
/// Depends only on path, version, hash and status, so both peers can derive
/// it from their view of the committed state.
pub fn state_digest(files: &BTreeMap<String, FileEntry>) -> String {
	let mut ctx = md5::Context::new();
	for (path, entry) in files {
		ctx.consume(path.as_bytes());
		ctx.consume(b"\0");
		ctx.consume(entry.version.to_string().as_bytes());
		ctx.consume(b"\0");
		ctx.consume(entry.hash.as_bytes());
		ctx.consume(b"\0");
		ctx.consume(if entry.is_active() { b"a" } else { b"d" });
		ctx.consume(b"\n");
	}
	format!("{:x}", ctx.compute())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_md5_hex_known_value() {
		// md5("hello")
		assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
	}

	#[test]
	fn test_tmp_filename_appends_suffix() {
		let tmp = tmp_filename(Path::new("dir/a.txt"));
		assert_eq!(tmp, PathBuf::from("dir/a.txt.sync-tmp"));
	}

	#[test]
	fn test_safe_rel_path() {
		assert!(is_safe_rel_path("a.txt"));
		assert!(is_safe_rel_path("dir/sub/a.txt"));
		assert!(!is_safe_rel_path(""));
		assert!(!is_safe_rel_path("/etc/passwd"));
		assert!(!is_safe_rel_path("../escape"));
		assert!(!is_safe_rel_path("dir/../escape"));
		assert!(!is_safe_rel_path("dir//a.txt"));
		assert!(!is_safe_rel_path("dir/./a.txt"));
	}
}

// vim: ts=4
