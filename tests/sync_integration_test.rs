/// End-to-end client/server sessions over a loopback listener
///
/// Each test binds a real server on an ephemeral port, runs whole sessions
/// through the client driver and inspects the persisted state documents on
/// both sides.
use std::net::SocketAddr;
use std::path::Path;

use syncbox::config::{self, Config};
use syncbox::connect::{self, SyncOutcome};
use syncbox::plan::{ConflictStrategy, SyncMode};
use syncbox::serve::Server;
use syncbox::state::{FileStatus, SyncState};

fn server_config(data_root: &Path) -> Config {
	let mut config = Config::default();
	config.server.bind_address = "127.0.0.1".to_string();
	config.server.port = 0;
	config.server.data_root = data_root.to_path_buf();
	config
}

fn client_config(local_root: &Path, addr: SocketAddr) -> Config {
	let mut config = Config::default();
	config.client.local_root = local_root.to_path_buf();
	config.client.remote_host = addr.ip().to_string();
	config.client.remote_port = addr.port();
	config
}

async fn spawn_server(config: Config) -> SocketAddr {
	let server = Server::bind(config).await.unwrap();
	let addr = server.local_addr().unwrap();
	tokio::spawn(server.run());
	addr
}

async fn read_state(path: &Path) -> SyncState {
	serde_json::from_slice(&tokio::fs::read(path).await.unwrap()).unwrap()
}

async fn push(config: &Config, strategy: ConflictStrategy) -> SyncOutcome {
	connect::run_sync(config, SyncMode::Push, strategy).await.unwrap()
}

async fn pull(config: &Config, strategy: ConflictStrategy) -> SyncOutcome {
	connect::run_sync(config, SyncMode::Pull, strategy).await.unwrap()
}

fn completed(outcome: SyncOutcome) -> connect::SessionSummary {
	match outcome {
		SyncOutcome::Completed(summary) => summary,
		SyncOutcome::Conflicts(conflicts) => panic!("unexpected conflicts: {:?}", conflicts),
	}
}

// First push: a single small file lands on the server at version 1 and the
// global version becomes 1.
#[tokio::test]
async fn test_first_push_creates_server_file() {
	let server_root = tempfile::tempdir().unwrap();
	let client_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	tokio::fs::write(client_root.path().join("a.txt"), b"hello").await.unwrap();
	let config = client_config(client_root.path(), addr);
	let summary = completed(push(&config, ConflictStrategy::Ask).await);

	assert_eq!(summary.uploaded, 1);
	assert_eq!(summary.sync_version, 1);
	assert_eq!(
		tokio::fs::read(server_root.path().join("a.txt")).await.unwrap(),
		b"hello"
	);

	let server_state = read_state(&server_root.path().join("server_sync_state.json")).await;
	let entry = &server_state.files["a.txt"];
	assert_eq!(entry.version, 1);
	assert_eq!(entry.hash, "5d41402abc4b2a76b9719d911017c592");
	assert_eq!(entry.size, 5);
	assert_eq!(server_state.sync_version, 1);
	assert_eq!(server_state.client_id, "server");

	let client_state = read_state(&client_root.path().join("client_sync_state.json")).await;
	assert_eq!(client_state.base_version, 1);
	assert_eq!(client_state.sync_version, 1);
}

// Pull propagates a creation to a second, empty client.
#[tokio::test]
async fn test_pull_propagates_creation() {
	let server_root = tempfile::tempdir().unwrap();
	let client1_root = tempfile::tempdir().unwrap();
	let client2_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	tokio::fs::write(client1_root.path().join("a.txt"), b"hello").await.unwrap();
	completed(push(&client_config(client1_root.path(), addr), ConflictStrategy::Ask).await);

	let config2 = client_config(client2_root.path(), addr);
	let summary = completed(pull(&config2, ConflictStrategy::Ask).await);
	assert_eq!(summary.downloaded, 1);

	assert_eq!(
		tokio::fs::read(client2_root.path().join("a.txt")).await.unwrap(),
		b"hello"
	);
	let client2_state = read_state(&client2_root.path().join("client_sync_state.json")).await;
	assert_eq!(client2_state.base_version, 1);
	assert_eq!(client2_state.files["a.txt"].version, 1);
}

// Deletion propagates: tombstone on the server, file removed on the second
// client, tombstone retained in its state.
#[tokio::test]
async fn test_delete_propagates_via_tombstone() {
	let server_root = tempfile::tempdir().unwrap();
	let client1_root = tempfile::tempdir().unwrap();
	let client2_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	tokio::fs::write(client1_root.path().join("a.txt"), b"hello").await.unwrap();
	let config1 = client_config(client1_root.path(), addr);
	completed(push(&config1, ConflictStrategy::Ask).await);

	let config2 = client_config(client2_root.path(), addr);
	completed(pull(&config2, ConflictStrategy::Ask).await);

	// Client 1 deletes and pushes
	tokio::fs::remove_file(client1_root.path().join("a.txt")).await.unwrap();
	let summary = completed(push(&config1, ConflictStrategy::Ask).await);
	assert_eq!(summary.deleted_remote, 1);

	let server_state = read_state(&server_root.path().join("server_sync_state.json")).await;
	let entry = &server_state.files["a.txt"];
	assert_eq!(entry.status, FileStatus::Deleted);
	assert_eq!(entry.version, 2);
	assert_eq!(server_state.sync_version, 2);
	assert!(!server_root.path().join("a.txt").exists());

	// Client 2 pulls the deletion
	let summary = completed(pull(&config2, ConflictStrategy::Ask).await);
	assert_eq!(summary.deleted_local, 1);
	assert!(!client2_root.path().join("a.txt").exists());

	let client2_state = read_state(&client2_root.path().join("client_sync_state.json")).await;
	let entry = &client2_state.files["a.txt"];
	assert_eq!(entry.status, FileStatus::Deleted);
	assert_eq!(entry.version, 2);
	assert_eq!(client2_state.base_version, 2);
}

// Concurrent edit: the slower client's push is refused under `ask` with no
// server mutation, and skipped (session still succeeds) under `remote`.
#[tokio::test]
async fn test_concurrent_edit_conflict() {
	let server_root = tempfile::tempdir().unwrap();
	let client1_root = tempfile::tempdir().unwrap();
	let client2_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	tokio::fs::write(client1_root.path().join("a.txt"), b"hello").await.unwrap();
	let config1 = client_config(client1_root.path(), addr);
	let config2 = client_config(client2_root.path(), addr);
	completed(push(&config1, ConflictStrategy::Ask).await);
	completed(pull(&config2, ConflictStrategy::Ask).await);

	// Client 1 wins the race
	tokio::fs::write(client1_root.path().join("a.txt"), b"hi").await.unwrap();
	completed(push(&config1, ConflictStrategy::Ask).await);

	// Client 2 edits from the stale base and pushes under `ask`
	tokio::fs::write(client2_root.path().join("a.txt"), b"yo").await.unwrap();
	let outcome = push(&config2, ConflictStrategy::Ask).await;
	let conflicts = match outcome {
		SyncOutcome::Conflicts(conflicts) => conflicts,
		SyncOutcome::Completed(_) => panic!("expected conflicts"),
	};
	assert_eq!(conflicts.len(), 1);
	assert_eq!(conflicts[0].path, "a.txt");

	// No server mutation happened
	let server_state = read_state(&server_root.path().join("server_sync_state.json")).await;
	assert_eq!(server_state.sync_version, 2);
	assert_eq!(
		tokio::fs::read(server_root.path().join("a.txt")).await.unwrap(),
		b"hi"
	);

	// Under `remote` the push skips the conflicted path and succeeds
	let summary = completed(push(&config2, ConflictStrategy::Remote).await);
	assert_eq!(summary.uploaded, 0);

	let server_state = read_state(&server_root.path().join("server_sync_state.json")).await;
	assert_eq!(server_state.sync_version, 2);
	assert_eq!(
		tokio::fs::read(server_root.path().join("a.txt")).await.unwrap(),
		b"hi"
	);
	// The session completed, so the client caught up to the server version
	let client2_state = read_state(&client2_root.path().join("client_sync_state.json")).await;
	assert_eq!(client2_state.base_version, 2);
}

// Delete-versus-edit under `remote`: the strategy-forced deletion is applied
// locally even though the tombstone version does not dominate the local edit.
#[tokio::test]
async fn test_remote_strategy_applies_forced_deletion_on_pull() {
	let server_root = tempfile::tempdir().unwrap();
	let client1_root = tempfile::tempdir().unwrap();
	let client2_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	tokio::fs::write(client1_root.path().join("a.txt"), b"hello").await.unwrap();
	let config1 = client_config(client1_root.path(), addr);
	let config2 = client_config(client2_root.path(), addr);
	completed(push(&config1, ConflictStrategy::Ask).await);
	completed(pull(&config2, ConflictStrategy::Ask).await);

	// Client 1 deletes and pushes the tombstone (server v2); client 2 edits
	// the same file, reaching its own v2
	tokio::fs::remove_file(client1_root.path().join("a.txt")).await.unwrap();
	completed(push(&config1, ConflictStrategy::Ask).await);
	tokio::fs::write(client2_root.path().join("a.txt"), b"edited").await.unwrap();

	// Under `ask` the pull surfaces the conflict and changes nothing
	let outcome = pull(&config2, ConflictStrategy::Ask).await;
	match outcome {
		SyncOutcome::Conflicts(conflicts) => {
			assert_eq!(conflicts.len(), 1);
			assert_eq!(conflicts[0].path, "a.txt");
		}
		SyncOutcome::Completed(_) => panic!("expected conflicts"),
	}
	assert!(client2_root.path().join("a.txt").exists());

	// Under `remote` the server-computed deletion wins
	let summary = completed(pull(&config2, ConflictStrategy::Remote).await);
	assert_eq!(summary.deleted_local, 1);
	assert_eq!(summary.skipped, 0);
	assert!(!client2_root.path().join("a.txt").exists());

	let client2_state = read_state(&client2_root.path().join("client_sync_state.json")).await;
	let entry = &client2_state.files["a.txt"];
	assert_eq!(entry.status, FileStatus::Deleted);
	assert_eq!(entry.version, 2);
	assert_eq!(client2_state.base_version, 2);
}

// A large random file survives the chunked path byte-for-byte, through
// compression and encryption, server-side re-hash included.
#[tokio::test]
async fn test_large_file_integrity_encrypted_compressed() {
	use rand::RngCore;

	let server_root = tempfile::tempdir().unwrap();
	let client1_root = tempfile::tempdir().unwrap();
	let client3_root = tempfile::tempdir().unwrap();
	let key_dir = tempfile::tempdir().unwrap();
	let key_file = key_dir.path().join("syncbox.key");
	config::generate_key_file(&key_file).unwrap();

	let mut server_cfg = server_config(server_root.path());
	server_cfg.sync.compression = true;
	server_cfg.encryption.enabled = true;
	server_cfg.encryption.key_file = key_file.clone();
	let addr = spawn_server(server_cfg).await;

	let mut content = vec![0u8; 10 * 1024 * 1024];
	rand::thread_rng().fill_bytes(&mut content);
	tokio::fs::write(client1_root.path().join("big.bin"), &content).await.unwrap();

	let mut config1 = client_config(client1_root.path(), addr);
	config1.sync.compression = true;
	config1.encryption.enabled = true;
	config1.encryption.key_file = key_file.clone();
	let summary = completed(push(&config1, ConflictStrategy::Ask).await);
	assert_eq!(summary.uploaded, 1);

	// Server accepted the re-hashed content
	assert_eq!(
		tokio::fs::read(server_root.path().join("big.bin")).await.unwrap(),
		content
	);

	let mut config3 = client_config(client3_root.path(), addr);
	config3.sync.compression = true;
	config3.encryption.enabled = true;
	config3.encryption.key_file = key_file.clone();
	let summary = completed(pull(&config3, ConflictStrategy::Ask).await);
	assert_eq!(summary.downloaded, 1);
	assert_eq!(
		tokio::fs::read(client3_root.path().join("big.bin")).await.unwrap(),
		content
	);
}

// Mismatched keys must not get past the handshake.
#[tokio::test]
async fn test_wrong_key_rejected() {
	let server_root = tempfile::tempdir().unwrap();
	let client_root = tempfile::tempdir().unwrap();
	let key_dir = tempfile::tempdir().unwrap();
	let server_key = key_dir.path().join("server.key");
	let client_key = key_dir.path().join("client.key");
	config::generate_key_file(&server_key).unwrap();
	config::generate_key_file(&client_key).unwrap();

	let mut server_cfg = server_config(server_root.path());
	server_cfg.encryption.enabled = true;
	server_cfg.encryption.key_file = server_key;
	let addr = spawn_server(server_cfg).await;

	tokio::fs::write(client_root.path().join("a.txt"), b"hello").await.unwrap();
	let mut config = client_config(client_root.path(), addr);
	config.encryption.enabled = true;
	config.encryption.key_file = client_key;

	assert!(connect::run_sync(&config, SyncMode::Push, ConflictStrategy::Ask).await.is_err());
	// The server must not have accepted anything
	assert!(!server_root.path().join("a.txt").exists());
}

// Reissuing an identical request after a successful session is a no-op: the
// plan recomputes as empty and the global version does not move.
#[tokio::test]
async fn test_reissued_push_is_idempotent() {
	let server_root = tempfile::tempdir().unwrap();
	let client_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	tokio::fs::write(client_root.path().join("a.txt"), b"hello").await.unwrap();
	let config = client_config(client_root.path(), addr);
	let first = completed(push(&config, ConflictStrategy::Ask).await);
	assert_eq!(first.uploaded, 1);
	assert_eq!(first.sync_version, 1);

	let second = completed(push(&config, ConflictStrategy::Ask).await);
	assert_eq!(second.uploaded, 0);
	assert_eq!(second.sync_version, 1);

	let server_state = read_state(&server_root.path().join("server_sync_state.json")).await;
	assert_eq!(server_state.sync_version, 1);
	assert_eq!(server_state.files["a.txt"].version, 1);
}

// Successive commits from different clients strictly increase the global
// version, and the second client's stale push is caught.
#[tokio::test]
async fn test_global_version_strictly_increases() {
	let server_root = tempfile::tempdir().unwrap();
	let client1_root = tempfile::tempdir().unwrap();
	let client2_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	let config1 = client_config(client1_root.path(), addr);
	let config2 = client_config(client2_root.path(), addr);

	tokio::fs::write(client1_root.path().join("one.txt"), b"1").await.unwrap();
	let first = completed(push(&config1, ConflictStrategy::Ask).await);

	tokio::fs::write(client2_root.path().join("two.txt"), b"2").await.unwrap();
	let second = completed(push(&config2, ConflictStrategy::Ask).await);

	assert!(second.sync_version > first.sync_version);

	let server_state = read_state(&server_root.path().join("server_sync_state.json")).await;
	assert_eq!(server_state.files.len(), 2);
	assert_eq!(server_state.sync_version, second.sync_version);
}

// Read-only operations: list/status fetch the server state without mutating
// anything.
#[tokio::test]
async fn test_fetch_server_state_and_local_changes() {
	let server_root = tempfile::tempdir().unwrap();
	let client_root = tempfile::tempdir().unwrap();
	let addr = spawn_server(server_config(server_root.path())).await;

	tokio::fs::write(client_root.path().join("a.txt"), b"hello").await.unwrap();
	let config = client_config(client_root.path(), addr);
	completed(push(&config, ConflictStrategy::Ask).await);

	let server_state = connect::fetch_server_state(&config).await.unwrap();
	assert_eq!(server_state.sync_version, 1);
	assert!(server_state.files.contains_key("a.txt"));

	// A local edit shows up in `changes` without a session
	tokio::fs::write(client_root.path().join("b.txt"), b"new").await.unwrap();
	tokio::fs::write(client_root.path().join("a.txt"), b"edited").await.unwrap();
	let changes = connect::local_changes(&config).await.unwrap();
	assert_eq!(changes.created, vec!["b.txt".to_string()]);
	assert_eq!(changes.modified, vec!["a.txt".to_string()]);
	assert!(changes.deleted.is_empty());

	let report = connect::status(&config).await.unwrap();
	assert_eq!(report.server_sync_version, 1);
	assert_eq!(report.base_version, 1);
	assert!(!report.diverged);
}
