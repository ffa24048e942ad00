//! Configuration loading
//!
//! All configuration lives in a single TOML document with `[server]`,
//! `[client]`, `[sync]` and `[encryption]` sections. Every key has a
//! built-in default, so a missing file or a partial one is fine for the
//! client side; the server refuses to start only when encryption is enabled
//! and the key file cannot be loaded.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::plan::ConflictStrategy;

/// Default config file name probed when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "syncbox.toml";

/// Decoded symmetric key length
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
	pub server: ServerConfig,
	pub client: ClientConfig,
	pub sync: SyncConfig,
	pub encryption: EncryptionConfig,
}

/// Server-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	/// Client-facing address, for documentation and tooling
	pub host: String,

	pub port: u16,

	/// Address the listener binds
	pub bind_address: String,

	/// Root of the authoritative tree; the state document lives here too
	pub data_root: PathBuf,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			host: "127.0.0.1".to_string(),
			port: 8379,
			bind_address: "0.0.0.0".to_string(),
			data_root: PathBuf::from("./data"),
		}
	}
}

/// Client-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
	pub remote_host: String,
	pub remote_port: u16,

	/// Root of the synced local tree; the state document lives here too
	pub local_root: PathBuf,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig {
			remote_host: "127.0.0.1".to_string(),
			remote_port: 8379,
			local_root: PathBuf::from("."),
		}
	}
}

/// Session behavior shared by both sides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Glob patterns excluded from scans
	pub ignore_patterns: Vec<String>,

	/// Deflate payloads over the envelope threshold
	pub compression: bool,

	/// Streamed body frame size for large transfers
	pub chunk_size: usize,

	pub conflict_strategy: ConflictStrategy,

	/// Stalled-session cutoff in seconds
	pub idle_timeout_secs: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			ignore_patterns: vec![],
			compression: false,
			chunk_size: 65536,
			conflict_strategy: ConflictStrategy::Ask,
			idle_timeout_secs: 60,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
	pub enabled: bool,
	pub key_file: PathBuf,
}

impl Default for EncryptionConfig {
	fn default() -> Self {
		EncryptionConfig { enabled: false, key_file: PathBuf::from("syncbox.key") }
	}
}

impl Config {
	/// Load configuration.
	///
	/// An explicit path must exist and parse. Without one, `syncbox.toml`
	/// in the working directory is used when present, otherwise built-in
	/// defaults apply.
	pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
		match path {
			Some(path) => Self::load_file(path),
			None => {
				let fallback = Path::new(DEFAULT_CONFIG_FILE);
				if fallback.exists() {
					Self::load_file(fallback)
				} else {
					Ok(Config::default())
				}
			}
		}
	}

	fn load_file(path: &Path) -> Result<Config, ConfigError> {
		let contents = std::fs::read_to_string(path)
			.map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
		toml::from_str(&contents)
			.map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })
	}

	/// Load the symmetric key when encryption is enabled.
	///
	/// Returns `None` when encryption is off. A missing or malformed key
	/// file with encryption enabled is a fatal startup error.
	pub fn load_key(&self) -> Result<Option<[u8; KEY_LEN]>, ConfigError> {
		if !self.encryption.enabled {
			return Ok(None);
		}
		load_key_file(&self.encryption.key_file).map(Some)
	}
}

/// Read a single-line URL-safe base64 key file into raw key bytes
pub fn load_key_file(path: &Path) -> Result<[u8; KEY_LEN], ConfigError> {
	let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::KeyFile {
		path: path.to_path_buf(),
		message: e.to_string(),
	})?;
	let decoded = URL_SAFE.decode(contents.trim()).map_err(|e| ConfigError::KeyFile {
		path: path.to_path_buf(),
		message: format!("not valid base64: {}", e),
	})?;
	if decoded.len() != KEY_LEN {
		return Err(ConfigError::KeyFile {
			path: path.to_path_buf(),
			message: format!("expected {} key bytes, got {}", KEY_LEN, decoded.len()),
		});
	}
	let mut key = [0u8; KEY_LEN];
	key.copy_from_slice(&decoded);
	Ok(key)
}

/// Generate a fresh key and write it as a single base64 line
pub fn generate_key_file(path: &Path) -> Result<(), ConfigError> {
	let mut key = [0u8; KEY_LEN];
	rand::rngs::OsRng.fill_bytes(&mut key);
	let line = format!("{}\n", URL_SAFE.encode(key));

	std::fs::write(path, line).map_err(|e| ConfigError::KeyFile {
		path: path.to_path_buf(),
		message: e.to_string(),
	})?;

	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		let perms = std::fs::Permissions::from_mode(0o600);
		std::fs::set_permissions(path, perms).map_err(|e| ConfigError::KeyFile {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?;
	}

	Ok(())
}


// vim: ts=4
