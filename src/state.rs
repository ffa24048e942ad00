//! Versioned sync state: per-path entries, tombstones and persistence
//!
//! The state document is a single JSON file holding one `FileEntry` per path
//! ever observed under the sync root. Deleted paths stay in the map as
//! tombstones so deletions propagate to peers; compaction is an explicit
//! operation outside this module's scope.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::StateError;
use crate::scan::ScanEntry;
use crate::util;

/// Identifier the server uses in its own state document
pub const SERVER_CLIENT_ID: &str = "server";

/// Lifecycle status of a tracked path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
	Active,
	Deleted,
}

/// One record per path ever observed under the sync root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
	/// Relative path from the sync root, `/`-separated
	pub path: String,

	/// Hex MD5 fingerprint of the content; empty iff deleted
	pub hash: String,

	/// Byte length; 0 iff deleted
	pub size: u64,

	/// Timestamp of last content change
	pub modified: u64,

	/// Monotonically non-decreasing per-path version
	pub version: u64,

	pub status: FileStatus,

	/// Deletion timestamp; present iff deleted
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub deleted_at: Option<u64>,
}

impl FileEntry {
	pub fn is_active(&self) -> bool {
		self.status == FileStatus::Active
	}

	/// Transition this entry to a tombstone at `version`
	pub fn into_tombstone(mut self, version: u64, now: u64) -> FileEntry {
		self.hash = String::new();
		self.size = 0;
		self.version = version;
		self.status = FileStatus::Deleted;
		self.deleted_at = Some(now);
		self
	}
}

/// The persisted state document, one per side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
	/// Path -> entry, including tombstones
	pub files: BTreeMap<String, FileEntry>,

	/// Global version: highest assigned version on the server, the server's
	/// version at last session start on a client
	pub sync_version: u64,

	/// Server version observed at the end of the last successful client
	/// session; 0 and ignored on the server record
	#[serde(default)]
	pub base_version: u64,

	/// Stable short identifier (random 8-hex on clients, "server" on the server)
	pub client_id: String,

	#[serde(default)]
	pub last_sync_time: u64,
}

impl SyncState {
	/// Fresh client state with a newly generated id
	pub fn new_client() -> Self {
		SyncState {
			files: BTreeMap::new(),
			sync_version: 0,
			base_version: 0,
			client_id: generate_client_id(),
			last_sync_time: 0,
		}
	}

	/// Fresh server state
	pub fn new_server() -> Self {
		SyncState {
			files: BTreeMap::new(),
			sync_version: 0,
			base_version: 0,
			client_id: SERVER_CLIENT_ID.to_string(),
			last_sync_time: 0,
		}
	}

	/// Highest per-file version in the document
	pub fn max_file_version(&self) -> u64 {
		self.files.values().map(|e| e.version).max().unwrap_or(0)
	}

	pub fn active_count(&self) -> usize {
		self.files.values().filter(|e| e.is_active()).count()
	}

	pub fn tombstone_count(&self) -> usize {
		self.files.values().filter(|e| !e.is_active()).count()
	}
}

/// Random 8-hex client identifier
pub fn generate_client_id() -> String {
	let mut bytes = [0u8; 4];
	rand::thread_rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

/// Merge a fresh scan into the previously persisted entries.
///
/// Carries unchanged entries forward without a version bump, bumps changed
/// ones, inserts new paths at version 1 and tombstones paths that
/// disappeared. Existing tombstones are carried unchanged, never resurrected
/// by a rescan.
pub fn reconcile(
	previous: &BTreeMap<String, FileEntry>,
	scanned: &BTreeMap<String, ScanEntry>,
	now: u64,
) -> BTreeMap<String, FileEntry> {
	let mut out = BTreeMap::new();

	for (path, scan) in scanned {
		let entry = match previous.get(path) {
			Some(prev) if prev.is_active() && prev.hash == scan.hash => prev.clone(),
			Some(prev) => FileEntry {
				path: path.clone(),
				hash: scan.hash.clone(),
				size: scan.size,
				modified: scan.modified,
				version: prev.version + 1,
				status: FileStatus::Active,
				deleted_at: None,
			},
			None => FileEntry {
				path: path.clone(),
				hash: scan.hash.clone(),
				size: scan.size,
				modified: scan.modified,
				version: 1,
				status: FileStatus::Active,
				deleted_at: None,
			},
		};
		out.insert(path.clone(), entry);
	}

	for (path, prev) in previous {
		if out.contains_key(path) {
			continue;
		}
		let entry = if prev.is_active() {
			prev.clone().into_tombstone(prev.version + 1, now)
		} else {
			prev.clone()
		};
		out.insert(path.clone(), entry);
	}

	out
}

/// Persistent store for one state document
pub struct StateStore {
	path: PathBuf,
}

impl StateStore {
	pub fn new(path: PathBuf) -> Self {
		StateStore { path }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Load the client state, falling back to a fresh one when the file is
	/// missing or malformed
	pub async fn load_or_init_client(&self) -> Result<SyncState, StateError> {
		self.load_or_init(SyncState::new_client).await
	}

	/// Load the server state, falling back to a fresh one
	pub async fn load_or_init_server(&self) -> Result<SyncState, StateError> {
		self.load_or_init(SyncState::new_server).await
	}

	async fn load_or_init(&self, init: fn() -> SyncState) -> Result<SyncState, StateError> {
		match tokio::fs::read(&self.path).await {
			Ok(contents) => match serde_json::from_slice::<SyncState>(&contents) {
				Ok(state) => Ok(state),
				Err(e) => {
					tracing::warn!(
						path = %self.path.display(),
						error = %e,
						"state document malformed, starting fresh"
					);
					Ok(init())
				}
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(init()),
			Err(e) => Err(StateError::LoadFailed { source: Box::new(e) }),
		}
	}

	/// Persist the document atomically: write a sibling temp file, then
	/// rename over the target
	pub async fn save(&self, state: &SyncState) -> Result<(), StateError> {
		let json = serde_json::to_vec_pretty(state)
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;

		let tmp = util::tmp_filename(&self.path);
		tokio::fs::write(&tmp, &json)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		tokio::fs::rename(&tmp, &self.path)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scan_entry(hash: &str, size: u64) -> ScanEntry {
		ScanEntry { hash: hash.to_string(), size, modified: 1000 }
	}

	fn active_entry(path: &str, hash: &str, version: u64) -> FileEntry {
		FileEntry {
			path: path.to_string(),
			hash: hash.to_string(),
			size: 5,
			modified: 900,
			version,
			status: FileStatus::Active,
			deleted_at: None,
		}
	}

	#[test]
	fn test_reconcile_new_file_starts_at_version_one() {
		let prev = BTreeMap::new();
		let mut scanned = BTreeMap::new();
		scanned.insert("a.txt".to_string(), scan_entry("abc", 5));

		let out = reconcile(&prev, &scanned, 2000);
		let entry = &out["a.txt"];
		assert_eq!(entry.version, 1);
		assert_eq!(entry.status, FileStatus::Active);
	}

	#[test]
	fn test_reconcile_unchanged_keeps_version() {
		let mut prev = BTreeMap::new();
		prev.insert("a.txt".to_string(), active_entry("a.txt", "abc", 3));
		let mut scanned = BTreeMap::new();
		scanned.insert("a.txt".to_string(), scan_entry("abc", 5));

		let out = reconcile(&prev, &scanned, 2000);
		assert_eq!(out["a.txt"].version, 3);
	}

	#[test]
	fn test_reconcile_changed_bumps_version() {
		let mut prev = BTreeMap::new();
		prev.insert("a.txt".to_string(), active_entry("a.txt", "abc", 3));
		let mut scanned = BTreeMap::new();
		scanned.insert("a.txt".to_string(), scan_entry("def", 6));

		let out = reconcile(&prev, &scanned, 2000);
		let entry = &out["a.txt"];
		assert_eq!(entry.version, 4);
		assert_eq!(entry.hash, "def");
	}

	#[test]
	fn test_reconcile_missing_becomes_tombstone() {
		let mut prev = BTreeMap::new();
		prev.insert("a.txt".to_string(), active_entry("a.txt", "abc", 1));
		let scanned = BTreeMap::new();

		let out = reconcile(&prev, &scanned, 2000);
		let entry = &out["a.txt"];
		assert_eq!(entry.status, FileStatus::Deleted);
		assert_eq!(entry.version, 2);
		assert_eq!(entry.hash, "");
		assert_eq!(entry.size, 0);
		assert_eq!(entry.deleted_at, Some(2000));
	}

	#[test]
	fn test_reconcile_tombstone_carried_not_resurrected() {
		let mut prev = BTreeMap::new();
		prev.insert(
			"a.txt".to_string(),
			active_entry("a.txt", "abc", 1).into_tombstone(2, 1500),
		);
		let scanned = BTreeMap::new();

		let out = reconcile(&prev, &scanned, 2000);
		let entry = &out["a.txt"];
		assert_eq!(entry.status, FileStatus::Deleted);
		assert_eq!(entry.version, 2);
		assert_eq!(entry.deleted_at, Some(1500));
	}

	#[test]
	fn test_reconcile_versions_never_decrease() {
		let mut prev = BTreeMap::new();
		prev.insert("a.txt".to_string(), active_entry("a.txt", "abc", 7));
		let mut scanned = BTreeMap::new();
		scanned.insert("a.txt".to_string(), scan_entry("xyz", 9));

		let out = reconcile(&prev, &scanned, 2000);
		assert!(out["a.txt"].version >= 7);
	}

	#[test]
	fn test_client_id_format() {
		let id = generate_client_id();
		assert_eq!(id.len(), 8);
		assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn test_state_json_round_trip() {
		let mut state = SyncState::new_client();
		state.files.insert("a.txt".to_string(), active_entry("a.txt", "abc", 2));
		state.sync_version = 5;
		state.base_version = 5;

		let json = serde_json::to_string(&state).unwrap();
		let back: SyncState = serde_json::from_str(&json).unwrap();
		assert_eq!(back.sync_version, 5);
		assert_eq!(back.files["a.txt"], state.files["a.txt"]);
	}
}

// vim: ts=4
