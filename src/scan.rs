//! Directory scanning and content fingerprinting
//!
//! The scanner walks the sync root, skips ignore-glob matches and symlinks,
//! and fingerprints file content with streaming MD5. MD5 is used for change
//! detection only, not for security.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;

use crate::error::{ConfigError, SyncError};

/// Read buffer for content hashing
const SCAN_BUF_SIZE: usize = 64 * 1024;

/// Patterns always skipped, independent of configuration
const BUILTIN_IGNORES: &[&str] =
	&["client_sync_state.json", "server_sync_state.json", "*.sync-tmp"];

/// What a scan observed for one present file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
	pub hash: String,
	pub size: u64,
	pub modified: u64,
}

/// Directory walker with compiled ignore globs
pub struct Scanner {
	root: PathBuf,
	ignore: GlobSet,
}

impl Scanner {
	pub fn new(root: &Path, patterns: &[String]) -> Result<Scanner, ConfigError> {
		let mut builder = GlobSetBuilder::new();
		for pattern in BUILTIN_IGNORES.iter().map(|s| s.to_string()).chain(patterns.iter().cloned())
		{
			let glob = Glob::new(&pattern).map_err(|e| ConfigError::BadPattern {
				pattern: pattern.clone(),
				message: e.to_string(),
			})?;
			builder.add(glob);
		}
		let ignore = builder.build().map_err(|e| ConfigError::BadPattern {
			pattern: String::new(),
			message: e.to_string(),
		})?;

		Ok(Scanner { root: root.to_path_buf(), ignore })
	}

	/// Walk the root and fingerprint every present, non-ignored file.
	///
	/// Symlinks are not followed. Keys are `/`-separated paths relative to
	/// the root.
	pub async fn scan(&self) -> Result<BTreeMap<String, ScanEntry>, SyncError> {
		let mut out = BTreeMap::new();
		let mut stack = vec![self.root.clone()];

		while let Some(dir) = stack.pop() {
			let mut entries = tokio::fs::read_dir(&dir).await?;
			while let Some(entry) = entries.next_entry().await? {
				let path = entry.path();
				let meta = tokio::fs::symlink_metadata(&path).await?;
				if meta.file_type().is_symlink() {
					continue;
				}

				let rel = match path.strip_prefix(&self.root) {
					Ok(rel) => rel,
					Err(_) => continue,
				};
				let rel_str = rel_path_string(rel);
				if self.ignore.is_match(&rel_str) {
					continue;
				}

				if meta.is_dir() {
					stack.push(path);
				} else if meta.is_file() {
					let (hash, size) = hash_file(&path).await?;
					let modified = meta
						.modified()
						.ok()
						.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
						.map(|d| d.as_secs())
						.unwrap_or(0);
					out.insert(rel_str, ScanEntry { hash, size, modified });
				}
			}
		}

		Ok(out)
	}
}

/// Relative path with `/` separators regardless of platform
fn rel_path_string(rel: &Path) -> String {
	rel.iter().map(|c| c.to_string_lossy()).collect::<Vec<_>>().join("/")
}

/// Streaming MD5 fingerprint and byte length of a file
pub async fn hash_file(path: &Path) -> io::Result<(String, u64)> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut ctx = md5::Context::new();
	let mut buf = vec![0u8; SCAN_BUF_SIZE];
	let mut size: u64 = 0;

	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		ctx.consume(&buf[..n]);
		size += n as u64;
	}

	Ok((format!("{:x}", ctx.compute()), size))
}


// vim: ts=4
