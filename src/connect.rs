//! Client driver: one end-to-end session against the server
//!
//! A session loads the local state, reconciles it with a fresh scan,
//! negotiates a plan over one connection and executes it. Received files are
//! written to a temp sibling and renamed; deletions the plan prescribed are
//! applied as negotiated, while any other incoming deletion must dominate
//! the local version. On success the client adopts the server's committed
//! global version as both `sync_version` and `base_version`.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProtocolError, SyncError};
use crate::plan::{Action, Conflict, ConflictStrategy, SyncMode};
use crate::protocol::{
	self, Command, CommitPayload, ConflictPayload, DeleteFilePayload, FileDataPayload,
	FrameCipher, FrameCodec, HelloPayload, PlanPayload, SyncCompletePayload, SyncRequestPayload,
	PROTOCOL_VERSION,
};
use crate::scan::Scanner;
use crate::state::{reconcile, FileEntry, FileStatus, StateStore, SyncState};
use crate::util;

/// Client state document file name under the local root
pub const CLIENT_STATE_FILE: &str = "client_sync_state.json";

/// Counters for a completed session
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
	pub uploaded: usize,
	pub downloaded: usize,
	pub deleted_remote: usize,
	pub deleted_local: usize,
	pub skipped: usize,
	pub sync_version: u64,
}

/// Result of a sync attempt
#[derive(Debug)]
pub enum SyncOutcome {
	Completed(SessionSummary),
	/// Unresolved conflicts under the `ask` strategy; nothing was mutated
	Conflicts(Vec<Conflict>),
}

/// Local changes relative to the persisted state
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
	pub created: Vec<String>,
	pub modified: Vec<String>,
	pub deleted: Vec<String>,
}

impl ChangeSet {
	pub fn is_empty(&self) -> bool {
		self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
	}
}

/// Combined local and server view for the `status` operation
#[derive(Debug)]
pub struct StatusReport {
	pub client_id: String,
	pub active_files: usize,
	pub tombstones: usize,
	pub base_version: u64,
	pub last_sync_time: u64,
	pub server_sync_version: u64,
	pub diverged: bool,
	pub pending: ChangeSet,
}

struct ClientSession {
	codec: FrameCodec,
	reader: OwnedReadHalf,
	writer: OwnedWriteHalf,
	timeout: Duration,
}

impl ClientSession {
	async fn open(config: &Config) -> Result<ClientSession, SyncError> {
		let cipher = config.load_key()?.map(|key| FrameCipher::new(&key));
		let codec = FrameCodec::new(cipher, config.sync.compression);
		let timeout = Duration::from_secs(config.sync.idle_timeout_secs);

		let addr = (config.client.remote_host.as_str(), config.client.remote_port);
		let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| ProtocolError::Timeout)??;
		let (reader, writer) = stream.into_split();

		Ok(ClientSession { codec, reader, writer, timeout })
	}

	async fn hello(&mut self, client_id: &str) -> Result<(), ProtocolError> {
		let payload = HelloPayload {
			client_id: client_id.to_string(),
			protocol_version: PROTOCOL_VERSION,
		};
		protocol::send_json(&self.codec, &mut self.writer, Command::Hello, &payload).await?;
		self.expect_ok().await?;
		Ok(())
	}

	async fn recv(&mut self) -> Result<(Command, Vec<u8>), ProtocolError> {
		protocol::recv_timeout(&self.codec, &mut self.reader, self.timeout).await
	}

	/// Timeout-bounded `OK` read, surfacing peer `ERROR`s
	async fn expect_ok(&mut self) -> Result<Vec<u8>, ProtocolError> {
		let (cmd, data) = self.recv().await?;
		match cmd {
			Command::Ok => Ok(data),
			Command::Error => {
				let payload: protocol::ErrorPayload = protocol::parse_json(&data)?;
				Err(ProtocolError::Remote { message: payload.message })
			}
			other => Err(ProtocolError::UnexpectedCommand {
				expected: "OK",
				got: other.token().to_string(),
			}),
		}
	}
}

/// Run one push or pull session end-to-end
pub async fn run_sync(
	config: &Config,
	mode: SyncMode,
	strategy: ConflictStrategy,
) -> Result<SyncOutcome, SyncError> {
	let root = config.client.local_root.clone();
	let store = StateStore::new(root.join(CLIENT_STATE_FILE));
	let mut state = store.load_or_init_client().await?;

	let scanner = Scanner::new(&root, &config.sync.ignore_patterns)?;
	let scanned = scanner.scan().await?;
	state.files = reconcile(&state.files, &scanned, util::now_ts());

	let mut session = ClientSession::open(config).await?;
	session.hello(&state.client_id).await?;
	info!(mode = %mode, client_id = %state.client_id, base_version = state.base_version, "session started");

	let request = SyncRequestPayload {
		mode,
		local_state: state.clone(),
		base_version: state.base_version,
		conflict_strategy: strategy,
	};
	protocol::send_json(&session.codec, &mut session.writer, Command::SyncRequest, &request)
		.await?;

	let (cmd, data) = session.recv().await?;
	let plan: PlanPayload = match cmd {
		Command::Conflict => {
			let payload: ConflictPayload = protocol::parse_json(&data)?;
			info!(conflicts = payload.conflicts.len(), "session aborted on conflicts");
			return Ok(SyncOutcome::Conflicts(payload.conflicts));
		}
		Command::Ok => protocol::parse_json(&data)?,
		Command::Error => {
			let payload: protocol::ErrorPayload = protocol::parse_json(&data)?;
			return Err(ProtocolError::Remote { message: payload.message }.into());
		}
		other => {
			return Err(ProtocolError::UnexpectedCommand {
				expected: "OK or CONFLICT",
				got: other.token().to_string(),
			}
			.into())
		}
	};

	let mut summary = match mode {
		SyncMode::Push => execute_push(&mut session, config, &mut state, &plan).await?,
		SyncMode::Pull => execute_pull(&mut session, config, &mut state, &plan).await?,
	};

	for adopt in &plan.adopts {
		if let Some(entry) = state.files.get_mut(&adopt.path) {
			entry.version = entry.version.max(adopt.version);
		}
	}
	state.last_sync_time = util::now_ts();
	summary.sync_version = state.sync_version;
	store.save(&state).await?;

	info!(
		mode = %mode,
		sync_version = state.sync_version,
		uploaded = summary.uploaded,
		downloaded = summary.downloaded,
		"session completed"
	);
	Ok(SyncOutcome::Completed(summary))
}

async fn execute_push(
	session: &mut ClientSession,
	config: &Config,
	state: &mut SyncState,
	plan: &PlanPayload,
) -> Result<SessionSummary, SyncError> {
	let root = &config.client.local_root;
	let mut summary = SessionSummary::default();

	for action in &plan.actions {
		match action {
			Action::Upload { path } => {
				let entry = match state.files.get(path) {
					Some(entry) if entry.is_active() => entry.clone(),
					// The file vanished between scan and execution
					_ => {
						summary.skipped += 1;
						continue;
					}
				};
				protocol::send_file(
					&session.codec,
					&mut session.writer,
					root,
					&entry,
					config.sync.chunk_size,
				)
				.await?;
				match protocol::recv_ack(&session.codec, &mut session.reader, session.timeout)
					.await?
				{
					Ok(()) => summary.uploaded += 1,
					Err(message) => {
						warn!(path = %path, %message, "server rejected upload");
						summary.skipped += 1;
					}
				}
			}
			Action::DeleteRemote { path, version } => {
				let payload = DeleteFilePayload { path: path.clone(), version: *version };
				protocol::send_json(
					&session.codec,
					&mut session.writer,
					Command::DeleteFile,
					&payload,
				)
				.await?;
				match protocol::recv_ack(&session.codec, &mut session.reader, session.timeout)
					.await?
				{
					Ok(()) => summary.deleted_remote += 1,
					Err(message) => {
						warn!(path = %path, %message, "server rejected deletion");
						summary.skipped += 1;
					}
				}
			}
			// Download and DeleteLocal never appear in push plans
			_ => {}
		}
	}

	let commit = complete_session(session, state).await?;
	for (path, version) in &commit.files {
		if let Some(entry) = state.files.get_mut(path) {
			entry.version = *version;
		}
	}
	state.sync_version = commit.sync_version;
	state.base_version = commit.sync_version;
	Ok(summary)
}

async fn execute_pull(
	session: &mut ClientSession,
	config: &Config,
	state: &mut SyncState,
	plan: &PlanPayload,
) -> Result<SessionSummary, SyncError> {
	let root = config.client.local_root.clone();
	let mut summary = SessionSummary::default();
	let expected = plan
		.actions
		.iter()
		.filter(|a| matches!(a, Action::Download { .. } | Action::DeleteLocal { .. }))
		.count();
	// Deletions the negotiated plan prescribes are applied even when their
	// version does not dominate: strategy-forced resolutions land here
	let planned_deletes: BTreeSet<&str> = plan
		.actions
		.iter()
		.filter_map(|a| match a {
			Action::DeleteLocal { path, .. } => Some(path.as_str()),
			_ => None,
		})
		.collect();

	for _ in 0..expected {
		let (cmd, data) = session.recv().await?;
		match cmd {
			Command::FileData => {
				let header: FileDataPayload = protocol::parse_json(&data)?;
				if !util::is_safe_rel_path(&header.path) {
					protocol::send_error(&session.codec, &mut session.writer, "unsafe path")
						.await;
					return Err(SyncError::InvalidPath { path: header.path });
				}
				apply_download(session, &root, state, &header, &mut summary).await?;
			}
			Command::DeleteFile => {
				let delete: DeleteFilePayload = protocol::parse_json(&data)?;
				if !util::is_safe_rel_path(&delete.path) {
					protocol::send_error(&session.codec, &mut session.writer, "unsafe path")
						.await;
					return Err(SyncError::InvalidPath { path: delete.path });
				}
				let forced = planned_deletes.contains(delete.path.as_str());
				apply_local_delete(session, &root, state, &delete, forced, &mut summary).await?;
			}
			// The server could not provide one planned item; stay aligned
			Command::Error => {
				let payload: protocol::ErrorPayload = protocol::parse_json(&data)?;
				warn!(message = %payload.message, "server skipped a planned item");
				summary.skipped += 1;
			}
			other => {
				return Err(ProtocolError::UnexpectedCommand {
					expected: "FILE_DATA or DELETE_FILE",
					got: other.token().to_string(),
				}
				.into())
			}
		}
	}

	let commit = complete_session(session, state).await?;
	state.sync_version = commit.sync_version;
	state.base_version = commit.sync_version;
	Ok(summary)
}

async fn apply_download(
	session: &mut ClientSession,
	root: &Path,
	state: &mut SyncState,
	header: &FileDataPayload,
	summary: &mut SessionSummary,
) -> Result<(), SyncError> {
	let target = root.join(&header.path);
	if let Some(parent) = target.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	let tmp = util::tmp_filename(&target);

	match protocol::recv_file_body(&session.codec, &mut session.reader, header, &tmp, session.timeout)
		.await?
	{
		Err(e) => {
			warn!(path = %header.path, error = %e, "download discarded");
			protocol::send_error(&session.codec, &mut session.writer, &e.to_string()).await;
			summary.skipped += 1;
		}
		Ok(()) => {
			tokio::fs::rename(&tmp, &target).await?;
			state.files.insert(
				header.path.clone(),
				FileEntry {
					path: header.path.clone(),
					hash: header.hash.clone(),
					size: header.size,
					modified: header.modified,
					version: header.version,
					status: FileStatus::Active,
					deleted_at: None,
				},
			);
			debug!(path = %header.path, version = header.version, "download applied");
			protocol::send_empty(&session.codec, &mut session.writer, Command::Ok).await?;
			summary.downloaded += 1;
		}
	}
	Ok(())
}

async fn apply_local_delete(
	session: &mut ClientSession,
	root: &Path,
	state: &mut SyncState,
	delete: &DeleteFilePayload,
	forced: bool,
	summary: &mut SessionSummary,
) -> Result<(), SyncError> {
	let dominated = state
		.files
		.get(&delete.path)
		.map(|entry| delete.version > entry.version)
		.unwrap_or(true);
	if !dominated && !forced {
		warn!(path = %delete.path, version = delete.version, "deletion does not dominate local version");
		protocol::send_error(
			&session.codec,
			&mut session.writer,
			&format!("version {} does not dominate local entry", delete.version),
		)
		.await;
		summary.skipped += 1;
		return Ok(());
	}

	let target = root.join(&delete.path);
	match tokio::fs::remove_file(&target).await {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
		Err(e) => return Err(e.into()),
	}

	let now = util::now_ts();
	let entry = match state.files.get(&delete.path).cloned() {
		// The tombstone never regresses the local version: a forced delete
		// of a higher local edit keeps that version
		Some(entry) => {
			let version = entry.version.max(delete.version);
			entry.into_tombstone(version, now)
		}
		None => FileEntry {
			path: delete.path.clone(),
			hash: String::new(),
			size: 0,
			modified: now,
			version: delete.version,
			status: FileStatus::Deleted,
			deleted_at: Some(now),
		},
	};
	state.files.insert(delete.path.clone(), entry);
	debug!(path = %delete.path, version = delete.version, "deletion applied");
	protocol::send_empty(&session.codec, &mut session.writer, Command::Ok).await?;
	summary.deleted_local += 1;
	Ok(())
}

/// Send `SYNC_COMPLETE` and read the committed versions back
async fn complete_session(
	session: &mut ClientSession,
	state: &SyncState,
) -> Result<CommitPayload, SyncError> {
	let payload = SyncCompletePayload { new_state_digest: util::state_digest(&state.files) };
	protocol::send_json(&session.codec, &mut session.writer, Command::SyncComplete, &payload)
		.await?;

	let data = session.expect_ok().await?;
	Ok(protocol::parse_json(&data)?)
}

/// Fetch the server's full state document over a read-only session
pub async fn fetch_server_state(config: &Config) -> Result<SyncState, SyncError> {
	let store = StateStore::new(config.client.local_root.join(CLIENT_STATE_FILE));
	let state = store.load_or_init_client().await?;

	let mut session = ClientSession::open(config).await?;
	session.hello(&state.client_id).await?;
	protocol::send_empty(&session.codec, &mut session.writer, Command::GetState).await?;
	let data = session.expect_ok().await?;
	Ok(protocol::parse_json(&data)?)
}

/// Diff a fresh scan against the persisted local state
pub async fn local_changes(config: &Config) -> Result<ChangeSet, SyncError> {
	let store = StateStore::new(config.client.local_root.join(CLIENT_STATE_FILE));
	let state = store.load_or_init_client().await?;
	let scanner = Scanner::new(&config.client.local_root, &config.sync.ignore_patterns)?;
	let scanned = scanner.scan().await?;

	let mut changes = ChangeSet::default();
	for (path, scan) in &scanned {
		match state.files.get(path) {
			None => changes.created.push(path.clone()),
			Some(entry) if !entry.is_active() => changes.created.push(path.clone()),
			Some(entry) if entry.hash != scan.hash => changes.modified.push(path.clone()),
			Some(_) => {}
		}
	}
	for (path, entry) in &state.files {
		if entry.is_active() && !scanned.contains_key(path) {
			changes.deleted.push(path.clone());
		}
	}
	Ok(changes)
}

/// Local summary plus the server's current version
pub async fn status(config: &Config) -> Result<StatusReport, SyncError> {
	let store = StateStore::new(config.client.local_root.join(CLIENT_STATE_FILE));
	let state = store.load_or_init_client().await?;
	let pending = local_changes(config).await?;
	let server_state = fetch_server_state(config).await?;

	Ok(StatusReport {
		client_id: state.client_id.clone(),
		active_files: state.active_count(),
		tombstones: state.tombstone_count(),
		base_version: state.base_version,
		last_sync_time: state.last_sync_time,
		server_sync_version: server_state.sync_version,
		diverged: state.base_version < server_state.sync_version,
		pending,
	})
}

// vim: ts=4
