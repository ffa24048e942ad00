//! Server loop: accept connections, run sessions, commit mutations
//!
//! The server owns the authoritative state behind one async guard. Plan
//! computation snapshots the state under the guard; push uploads are staged
//! to a session-private directory and applied in a single critical section
//! at `SYNC_COMPLETE`. Pull sessions never mutate the server and may run
//! concurrently.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProtocolError, SyncError};
use crate::plan::{self, Action, SyncMode, SyncPlan};
use crate::protocol::{
	self, Command, CommitPayload, ConflictPayload, DeleteFilePayload, FileDataPayload,
	FrameCipher, FrameCodec, HelloPayload, PlanPayload, SyncCompletePayload, SyncRequestPayload,
	PROTOCOL_VERSION,
};
use crate::state::{FileEntry, FileStatus, StateStore, SyncState};
use crate::util;

/// Server state document file name under the data root
pub const SERVER_STATE_FILE: &str = "server_sync_state.json";

/// Session-private staging area under the data root
const STAGING_DIR: &str = ".sync-staging";

/// Wire paths the server refuses to track: its own bookkeeping files
fn is_reserved_path(path: &str) -> bool {
	path == SERVER_STATE_FILE
		|| path == crate::connect::CLIENT_STATE_FILE
		|| path.starts_with(".sync-staging/")
		|| path.ends_with(util::TMP_SUFFIX)
}

struct ServerContext {
	config: Config,
	codec: FrameCodec,
	state: Mutex<SyncState>,
	store: StateStore,
	data_root: PathBuf,
}

impl ServerContext {
	fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.config.sync.idle_timeout_secs)
	}
}

/// A bound server, ready to accept sessions
pub struct Server {
	listener: TcpListener,
	ctx: Arc<ServerContext>,
}

impl Server {
	/// Load the authoritative state, set up the codec and bind the listener.
	/// Startup errors here are fatal; no work is accepted.
	pub async fn bind(config: Config) -> Result<Server, SyncError> {
		let data_root = config.server.data_root.clone();
		tokio::fs::create_dir_all(&data_root).await?;

		let store = StateStore::new(data_root.join(SERVER_STATE_FILE));
		let state = store.load_or_init_server().await?;

		let cipher = config.load_key()?.map(|key| FrameCipher::new(&key));
		let codec = FrameCodec::new(cipher, config.sync.compression);

		let listener =
			TcpListener::bind((config.server.bind_address.as_str(), config.server.port)).await?;
		info!(
			addr = %listener.local_addr()?,
			files = state.files.len(),
			sync_version = state.sync_version,
			"server listening"
		);

		Ok(Server {
			listener,
			ctx: Arc::new(ServerContext { config, codec, state: Mutex::new(state), store, data_root }),
		})
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Accept connections forever, one task per session
	pub async fn run(self) -> Result<(), SyncError> {
		loop {
			let (stream, peer) = self.listener.accept().await?;
			let ctx = self.ctx.clone();
			tokio::spawn(async move {
				handle_connection(ctx, stream, peer).await;
			});
		}
	}
}

/// Bind and run with the given configuration
pub async fn serve(config: Config) -> Result<(), SyncError> {
	Server::bind(config).await?.run().await
}

async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
	let session = uuid::Uuid::new_v4().to_string();
	debug!(%peer, %session, "connection accepted");

	let (mut reader, mut writer) = stream.into_split();
	match run_session(&ctx, &mut reader, &mut writer, &session).await {
		Ok(()) => debug!(%peer, %session, "session closed"),
		Err(e) => {
			warn!(%peer, %session, error = %e, "session failed");
			protocol::send_error(&ctx.codec, &mut writer, &e.to_string()).await;
		}
	}
}

async fn run_session(
	ctx: &ServerContext,
	reader: &mut OwnedReadHalf,
	writer: &mut OwnedWriteHalf,
	session: &str,
) -> Result<(), SyncError> {
	let codec = &ctx.codec;
	let timeout = ctx.idle_timeout();

	// Handshake
	let (cmd, data) = protocol::recv_timeout(codec, reader, timeout).await?;
	if cmd != Command::Hello {
		return Err(ProtocolError::UnexpectedCommand {
			expected: "HELLO",
			got: cmd.token().to_string(),
		}
		.into());
	}
	let hello: HelloPayload = protocol::parse_json(&data)?;
	if hello.protocol_version != PROTOCOL_VERSION {
		protocol::send_error(
			codec,
			writer,
			&format!("unsupported protocol version {}", hello.protocol_version),
		)
		.await;
		return Err(ProtocolError::VersionMismatch {
			local: PROTOCOL_VERSION,
			remote: hello.protocol_version,
		}
		.into());
	}
	protocol::send_empty(codec, writer, Command::Ok).await?;
	info!(client_id = %hello.client_id, %session, "client connected");

	loop {
		let (cmd, data) = match protocol::recv_timeout(codec, reader, timeout).await {
			// A peer hanging up between commands ends the session cleanly
			Err(ProtocolError::Disconnected) => return Ok(()),
			other => other?,
		};
		match cmd {
			Command::GetState => {
				let snapshot = ctx.state.lock().await.clone();
				let doc = serde_json::to_vec(&snapshot).map_err(ProtocolError::from)?;
				codec.send(writer, Command::Ok.token(), &doc).await?;
			}
			Command::SyncRequest => {
				let request: SyncRequestPayload = protocol::parse_json(&data)?;
				handle_sync(ctx, reader, writer, session, request).await?;
			}
			other => {
				protocol::send_error(codec, writer, &format!("unexpected command {}", other))
					.await;
				return Err(ProtocolError::UnexpectedCommand {
					expected: "SYNC_REQUEST or GET_STATE",
					got: other.token().to_string(),
				}
				.into());
			}
		}
	}
}

async fn handle_sync(
	ctx: &ServerContext,
	reader: &mut OwnedReadHalf,
	writer: &mut OwnedWriteHalf,
	session: &str,
	request: SyncRequestPayload,
) -> Result<(), SyncError> {
	let codec = &ctx.codec;
	let snapshot = ctx.state.lock().await.clone();
	let plan = plan::plan(
		&request.local_state,
		&snapshot,
		request.mode,
		request.conflict_strategy,
		request.base_version,
	);

	// Conflicts survive resolution only under the `ask` strategy; the
	// session then ends without mutation
	if plan.has_conflicts() {
		info!(
			%session,
			mode = %request.mode,
			conflicts = plan.conflicts.len(),
			"conflicts detected, aborting session"
		);
		let payload = ConflictPayload { conflicts: plan.conflicts };
		protocol::send_json(codec, writer, Command::Conflict, &payload).await?;
		return Ok(());
	}

	debug!(
		%session,
		mode = %request.mode,
		actions = plan.actions.len(),
		base_version = request.base_version,
		"plan negotiated"
	);
	let payload = PlanPayload { actions: plan.actions.clone(), adopts: plan.adopts.clone() };
	protocol::send_json(codec, writer, Command::Ok, &payload).await?;

	match request.mode {
		SyncMode::Push => run_push(ctx, reader, writer, session, &snapshot).await,
		SyncMode::Pull => run_pull(ctx, reader, writer, session, &plan, &snapshot).await,
	}
}

/// One verified upload waiting for commit
struct StagedFile {
	header: FileDataPayload,
	tmp: PathBuf,
}

async fn run_push(
	ctx: &ServerContext,
	reader: &mut OwnedReadHalf,
	writer: &mut OwnedWriteHalf,
	session: &str,
	snapshot: &SyncState,
) -> Result<(), SyncError> {
	let staging = ctx.data_root.join(STAGING_DIR).join(session);
	tokio::fs::create_dir_all(&staging).await?;

	let result = push_loop(ctx, reader, writer, session, snapshot, &staging).await;

	// Staged files from an aborted or committed session are gone either way
	let _ = tokio::fs::remove_dir_all(&staging).await;
	result
}

async fn push_loop(
	ctx: &ServerContext,
	reader: &mut OwnedReadHalf,
	writer: &mut OwnedWriteHalf,
	session: &str,
	snapshot: &SyncState,
	staging: &PathBuf,
) -> Result<(), SyncError> {
	let codec = &ctx.codec;
	let timeout = ctx.idle_timeout();
	let mut staged: Vec<StagedFile> = Vec::new();
	let mut deletes: Vec<DeleteFilePayload> = Vec::new();

	loop {
		let (cmd, data) = protocol::recv_timeout(codec, reader, timeout).await?;
		match cmd {
			Command::FileData => {
				let header: FileDataPayload = protocol::parse_json(&data)?;
				if !util::is_safe_rel_path(&header.path) || is_reserved_path(&header.path) {
					protocol::send_error(codec, writer, "unsafe path rejected").await;
					return Err(SyncError::InvalidPath { path: header.path });
				}

				let tmp = staging.join(staged.len().to_string());
				match protocol::recv_file_body(codec, reader, &header, &tmp, timeout).await? {
					Err(e) => {
						// Transfer-level failure: discard this file, keep the session
						warn!(%session, path = %header.path, error = %e, "transfer rejected");
						protocol::send_error(codec, writer, &e.to_string()).await;
					}
					Ok(()) => {
						debug!(%session, path = %header.path, size = header.size, "upload staged");
						staged.push(StagedFile { header, tmp });
						protocol::send_empty(codec, writer, Command::Ok).await?;
					}
				}
			}
			Command::DeleteFile => {
				let delete: DeleteFilePayload = protocol::parse_json(&data)?;
				if !util::is_safe_rel_path(&delete.path) || is_reserved_path(&delete.path) {
					protocol::send_error(codec, writer, "unsafe path rejected").await;
					return Err(SyncError::InvalidPath { path: delete.path });
				}
				debug!(%session, path = %delete.path, version = delete.version, "delete staged");
				deletes.push(delete);
				protocol::send_empty(codec, writer, Command::Ok).await?;
			}
			Command::SyncComplete => {
				let done: SyncCompletePayload = protocol::parse_json(&data)?;
				debug!(%session, digest = %done.new_state_digest, "commit requested");
				return commit_push(ctx, writer, session, snapshot, staged, deletes).await;
			}
			other => {
				protocol::send_error(codec, writer, &format!("unexpected command {}", other))
					.await;
				return Err(ProtocolError::UnexpectedCommand {
					expected: "FILE_DATA, DELETE_FILE or SYNC_COMPLETE",
					got: other.token().to_string(),
				}
				.into());
			}
		}
	}
}

/// The single critical section of a mutating session
async fn commit_push(
	ctx: &ServerContext,
	writer: &mut OwnedWriteHalf,
	session: &str,
	snapshot: &SyncState,
	staged: Vec<StagedFile>,
	deletes: Vec<DeleteFilePayload>,
) -> Result<(), SyncError> {
	let codec = &ctx.codec;
	let mut guard = ctx.state.lock().await;

	if staged.is_empty() && deletes.is_empty() {
		// Nothing committed, the global version is untouched
		let payload = CommitPayload { sync_version: guard.sync_version, files: BTreeMap::new() };
		protocol::send_json(codec, writer, Command::Ok, &payload).await?;
		return Ok(());
	}

	// Re-verify the plan's assumptions: an interleaved commit that touched
	// any of these paths invalidates the session, never silently regresses
	// a version
	let touched = staged
		.iter()
		.map(|s| s.header.path.as_str())
		.chain(deletes.iter().map(|d| d.path.as_str()));
	for path in touched {
		let current = guard.files.get(path).map(|e| e.version).unwrap_or(0);
		let planned = snapshot.files.get(path).map(|e| e.version).unwrap_or(0);
		if current != planned {
			warn!(%session, path, current, planned, "concurrent commit detected, aborting");
			protocol::send_error(codec, writer, &format!("concurrent commit touched {}", path))
				.await;
			return Err(SyncError::Other {
				message: format!("commit aborted: concurrent commit touched {}", path),
			});
		}
	}

	let rollback = guard.clone();
	let now = util::now_ts();
	let mut files_out: BTreeMap<String, u64> = BTreeMap::new();
	let mut touched_max: u64 = 0;

	if let Err(e) =
		apply_push(ctx, &mut guard, &staged, &deletes, now, &mut files_out, &mut touched_max).await
	{
		*guard = rollback;
		protocol::send_error(codec, writer, "commit failed").await;
		return Err(e);
	}

	let mut new_version = guard.sync_version.max(touched_max);
	if new_version <= guard.sync_version {
		new_version = guard.sync_version + 1;
	}
	guard.sync_version = new_version;
	guard.last_sync_time = now;

	if let Err(e) = ctx.store.save(&guard).await {
		*guard = rollback;
		protocol::send_error(codec, writer, "state persistence failed").await;
		return Err(e.into());
	}

	info!(
		%session,
		sync_version = new_version,
		uploads = staged.len(),
		deletes = deletes.len(),
		"push committed"
	);
	let payload = CommitPayload { sync_version: new_version, files: files_out };
	protocol::send_json(codec, writer, Command::Ok, &payload).await?;
	Ok(())
}

async fn apply_push(
	ctx: &ServerContext,
	state: &mut SyncState,
	staged: &[StagedFile],
	deletes: &[DeleteFilePayload],
	now: u64,
	files_out: &mut BTreeMap<String, u64>,
	touched_max: &mut u64,
) -> Result<(), SyncError> {
	for item in staged {
		let current = state.files.get(&item.header.path).map(|e| e.version).unwrap_or(0);
		// Adopt the client's version when it dominates, otherwise move past
		// the stored one (covers resurrection over an equal tombstone)
		let version = if item.header.version > current { item.header.version } else { current + 1 };

		let target = ctx.data_root.join(&item.header.path);
		if let Some(parent) = target.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::rename(&item.tmp, &target).await?;

		state.files.insert(
			item.header.path.clone(),
			FileEntry {
				path: item.header.path.clone(),
				hash: item.header.hash.clone(),
				size: item.header.size,
				modified: item.header.modified,
				version,
				status: FileStatus::Active,
				deleted_at: None,
			},
		);
		files_out.insert(item.header.path.clone(), version);
		*touched_max = (*touched_max).max(version);
	}

	for delete in deletes {
		let previous = state.files.get(&delete.path).cloned();
		let current = previous.as_ref().map(|e| e.version).unwrap_or(0);
		let version = if delete.version > current { delete.version } else { current + 1 };

		let target = ctx.data_root.join(&delete.path);
		match tokio::fs::remove_file(&target).await {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}

		let entry = match previous {
			Some(entry) => entry.into_tombstone(version, now),
			None => FileEntry {
				path: delete.path.clone(),
				hash: String::new(),
				size: 0,
				modified: now,
				version,
				status: FileStatus::Deleted,
				deleted_at: Some(now),
			},
		};
		state.files.insert(delete.path.clone(), entry);
		files_out.insert(delete.path.clone(), version);
		*touched_max = (*touched_max).max(version);
	}

	Ok(())
}

async fn run_pull(
	ctx: &ServerContext,
	reader: &mut OwnedReadHalf,
	writer: &mut OwnedWriteHalf,
	session: &str,
	plan: &SyncPlan,
	snapshot: &SyncState,
) -> Result<(), SyncError> {
	let codec = &ctx.codec;
	let timeout = ctx.idle_timeout();
	let chunk_size = ctx.config.sync.chunk_size;

	for action in &plan.actions {
		match action {
			Action::Download { path } => {
				let entry = match snapshot.files.get(path) {
					Some(entry) if entry.is_active() => entry,
					// State/disk drift: surface as a failed transfer so the
					// stream stays aligned with the plan
					_ => {
						protocol::send_error(codec, writer, &format!("{} not available", path))
							.await;
						continue;
					}
				};
				protocol::send_file(codec, writer, &ctx.data_root, entry, chunk_size).await?;
				match protocol::recv_ack(codec, reader, timeout).await? {
					Ok(()) => debug!(%session, path = %path, "download acknowledged"),
					Err(message) => {
						warn!(%session, path = %path, %message, "client rejected download")
					}
				}
			}
			Action::DeleteLocal { path, version } => {
				let payload = DeleteFilePayload { path: path.clone(), version: *version };
				protocol::send_json(codec, writer, Command::DeleteFile, &payload).await?;
				match protocol::recv_ack(codec, reader, timeout).await? {
					Ok(()) => debug!(%session, path = %path, "deletion acknowledged"),
					Err(message) => {
						warn!(%session, path = %path, %message, "client rejected deletion")
					}
				}
			}
			// Upload and DeleteRemote never appear in pull plans
			_ => {}
		}
	}

	let (cmd, data) = protocol::recv_timeout(codec, reader, timeout).await?;
	if cmd != Command::SyncComplete {
		return Err(ProtocolError::UnexpectedCommand {
			expected: "SYNC_COMPLETE",
			got: cmd.token().to_string(),
		}
		.into());
	}
	let done: SyncCompletePayload = protocol::parse_json(&data)?;
	debug!(%session, digest = %done.new_state_digest, "pull completed");

	// Pull mutates nothing server-side; the client adopts the snapshot version
	let payload = CommitPayload { sync_version: snapshot.sync_version, files: BTreeMap::new() };
	protocol::send_json(codec, writer, Command::Ok, &payload).await?;
	Ok(())
}

// vim: ts=4
