use clap::{Arg, Command};
use std::path::PathBuf;
use std::process::ExitCode;

use syncbox::config::{self, Config};
use syncbox::connect::{self, SyncOutcome};
use syncbox::logging;
use syncbox::plan::{ConflictStrategy, SyncMode};
use syncbox::serve;
use syncbox::SyncError;

#[tokio::main]
async fn main() -> ExitCode {
	logging::init_tracing();

	let matches = Command::new("syncbox")
		.version("0.2.0")
		.about("Client/server directory synchronizer")
		.subcommand_required(true)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("PATH")
				.global(true)
				.help("Configuration file"),
		)
		.arg(
			Arg::new("conflict")
				.long("conflict")
				.value_name("STRATEGY")
				.global(true)
				.help("Conflict strategy: ask, local, remote or skip"),
		)
		.subcommand(Command::new("serve").about("Run the authoritative server"))
		.subcommand(Command::new("push").about("Push local changes to the server"))
		.subcommand(Command::new("pull").about("Pull remote changes from the server"))
		.subcommand(Command::new("list").about("List files tracked by the server"))
		.subcommand(Command::new("changes").about("Show local changes since the last sync"))
		.subcommand(Command::new("status").about("Show local and server sync status"))
		.subcommand(
			Command::new("keygen")
				.about("Generate a symmetric key file")
				.arg(Arg::new("output").value_name("PATH").help("Key file to write")),
		)
		.get_matches();

	let config_path = matches.get_one::<String>("config").map(PathBuf::from);
	let config = match Config::load(config_path.as_deref()) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("syncbox: {}", e);
			return ExitCode::from(1);
		}
	};

	let strategy = match matches.get_one::<String>("conflict") {
		Some(value) => match value.parse::<ConflictStrategy>() {
			Ok(strategy) => strategy,
			Err(e) => {
				eprintln!("syncbox: {}", e);
				return ExitCode::from(1);
			}
		},
		None => config.sync.conflict_strategy,
	};

	let result = match matches.subcommand() {
		Some(("serve", _)) => serve::serve(config).await.map(|_| 0),
		Some(("push", _)) => run_sync(&config, SyncMode::Push, strategy).await,
		Some(("pull", _)) => run_sync(&config, SyncMode::Pull, strategy).await,
		Some(("list", _)) => run_list(&config).await,
		Some(("changes", _)) => run_changes(&config).await,
		Some(("status", _)) => run_status(&config).await,
		Some(("keygen", sub)) => {
			let output = sub
				.get_one::<String>("output")
				.map(PathBuf::from)
				.unwrap_or_else(|| config.encryption.key_file.clone());
			config::generate_key_file(&output).map_err(SyncError::from).map(|_| {
				println!("key written to {}", output.display());
				0
			})
		}
		_ => unreachable!("subcommand required"),
	};

	match result {
		Ok(code) => ExitCode::from(code),
		Err(e) => {
			eprintln!("syncbox: {}", e);
			ExitCode::from(1)
		}
	}
}

async fn run_sync(
	config: &Config,
	mode: SyncMode,
	strategy: ConflictStrategy,
) -> Result<u8, SyncError> {
	match connect::run_sync(config, mode, strategy).await? {
		SyncOutcome::Completed(summary) => {
			println!(
				"{} complete: {} uploaded, {} downloaded, {} deleted remotely, {} deleted locally, {} skipped (sync version {})",
				mode,
				summary.uploaded,
				summary.downloaded,
				summary.deleted_remote,
				summary.deleted_local,
				summary.skipped,
				summary.sync_version
			);
			Ok(0)
		}
		SyncOutcome::Conflicts(conflicts) => {
			eprintln!("{} unresolved conflict(s):", conflicts.len());
			for conflict in &conflicts {
				eprintln!("  {} ({}): {}", conflict.path, conflict.kind, conflict.detail);
			}
			eprintln!("re-run with --conflict local|remote|skip, or resolve manually");
			Ok(2)
		}
	}
}

async fn run_list(config: &Config) -> Result<u8, SyncError> {
	let server_state = connect::fetch_server_state(config).await?;
	for entry in server_state.files.values() {
		if entry.is_active() {
			println!("{:>12}  v{:<4}  {}", entry.size, entry.version, entry.path);
		} else {
			println!("{:>12}  v{:<4}  {} (deleted)", "-", entry.version, entry.path);
		}
	}
	println!(
		"{} active, {} tombstones, sync version {}",
		server_state.active_count(),
		server_state.tombstone_count(),
		server_state.sync_version
	);
	Ok(0)
}

async fn run_changes(config: &Config) -> Result<u8, SyncError> {
	let changes = connect::local_changes(config).await?;
	for path in &changes.created {
		println!("A {}", path);
	}
	for path in &changes.modified {
		println!("M {}", path);
	}
	for path in &changes.deleted {
		println!("D {}", path);
	}
	if changes.is_empty() {
		println!("no local changes");
	}
	Ok(0)
}

async fn run_status(config: &Config) -> Result<u8, SyncError> {
	let report = connect::status(config).await?;
	println!("client id:       {}", report.client_id);
	println!("local files:     {} active, {} tombstones", report.active_files, report.tombstones);
	println!("base version:    {}", report.base_version);
	println!("server version:  {}", report.server_sync_version);
	println!(
		"pending changes: {} added, {} modified, {} deleted",
		report.pending.created.len(),
		report.pending.modified.len(),
		report.pending.deleted.len()
	);
	if report.diverged {
		println!("server has commits this client has not pulled");
	}
	Ok(0)
}

// vim: ts=4
