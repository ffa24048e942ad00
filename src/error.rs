//! Error types for syncbox operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Main error type for sync operations
///
/// This is the unified error type that encompasses all sync-related errors.
/// It contains both direct variants for common errors and nested variants
/// for domain-specific errors.
#[derive(Debug)]
pub enum SyncError {
	/// Configuration or startup error (fatal before any work is accepted)
	Config(ConfigError),

	/// State load/persist error
	State(StateError),

	/// Protocol-level error (framing, auth, unexpected command)
	Protocol(ProtocolError),

	/// Transfer verification error (size or hash mismatch)
	Transfer(TransferError),

	/// I/O error
	Io(io::Error),

	/// A wire-supplied path failed validation
	InvalidPath { path: String },

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Config(e) => write!(f, "Configuration error: {}", e),
			SyncError::State(e) => write!(f, "State error: {}", e),
			SyncError::Protocol(e) => write!(f, "Protocol error: {}", e),
			SyncError::Transfer(e) => write!(f, "Transfer error: {}", e),
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::InvalidPath { path } => write!(f, "Invalid path: {}", path),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<ConfigError> for SyncError {
	fn from(e: ConfigError) -> Self {
		SyncError::Config(e)
	}
}

impl From<StateError> for SyncError {
	fn from(e: StateError) -> Self {
		SyncError::State(e)
	}
}

impl From<ProtocolError> for SyncError {
	fn from(e: ProtocolError) -> Self {
		SyncError::Protocol(e)
	}
}

impl From<TransferError> for SyncError {
	fn from(e: TransferError) -> Self {
		SyncError::Transfer(e)
	}
}

impl From<String> for SyncError {
	fn from(message: String) -> Self {
		SyncError::Other { message }
	}
}

/// Configuration and startup errors
#[derive(Debug)]
pub enum ConfigError {
	/// Config file could not be read
	Read { path: PathBuf, source: io::Error },

	/// Config file could not be parsed
	Parse { path: PathBuf, message: String },

	/// Key file missing or malformed
	KeyFile { path: PathBuf, message: String },

	/// Invalid ignore glob
	BadPattern { pattern: String, message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::Read { path, source } => {
				write!(f, "Failed to read {}: {}", path.display(), source)
			}
			ConfigError::Parse { path, message } => {
				write!(f, "Failed to parse {}: {}", path.display(), message)
			}
			ConfigError::KeyFile { path, message } => {
				write!(f, "Key file {}: {}", path.display(), message)
			}
			ConfigError::BadPattern { pattern, message } => {
				write!(f, "Invalid ignore pattern '{}': {}", pattern, message)
			}
		}
	}
}

impl Error for ConfigError {}

/// State management errors
#[derive(Debug)]
pub enum StateError {
	/// Failed to load state
	LoadFailed { source: Box<dyn Error + Send + Sync> },

	/// Failed to save state
	SaveFailed { source: Box<dyn Error + Send + Sync> },

	/// State document is corrupted beyond recovery
	Corrupted { message: String },
}

impl fmt::Display for StateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StateError::LoadFailed { source } => write!(f, "Failed to load state: {}", source),
			StateError::SaveFailed { source } => write!(f, "Failed to save state: {}", source),
			StateError::Corrupted { message } => write!(f, "State corrupted: {}", message),
		}
	}
}

impl Error for StateError {}

/// Protocol communication errors
#[derive(Debug)]
pub enum ProtocolError {
	/// Frame exceeds the wire limit
	FrameTooLarge { len: usize, max: usize },

	/// Unknown command token
	UnknownCommand { token: String },

	/// A different command was expected at this point of the session
	UnexpectedCommand { expected: &'static str, got: String },

	/// Protocol version mismatch in HELLO
	VersionMismatch { local: u32, remote: u32 },

	/// Authenticated decryption failed
	AuthFailed,

	/// Malformed payload (JSON, base64 or envelope)
	Decode { message: String },

	/// Peer reported an error
	Remote { message: String },

	/// Connection closed unexpectedly
	Disconnected,

	/// Idle timeout elapsed
	Timeout,

	/// Underlying I/O error
	Io(io::Error),
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::FrameTooLarge { len, max } => {
				write!(f, "Frame of {} bytes exceeds limit of {} bytes", len, max)
			}
			ProtocolError::UnknownCommand { token } => {
				write!(f, "Unknown command: {}", token)
			}
			ProtocolError::UnexpectedCommand { expected, got } => {
				write!(f, "Expected {}, got {}", expected, got)
			}
			ProtocolError::VersionMismatch { local, remote } => {
				write!(f, "Protocol version mismatch: local={}, remote={}", local, remote)
			}
			ProtocolError::AuthFailed => write!(f, "Frame authentication failed"),
			ProtocolError::Decode { message } => write!(f, "Malformed payload: {}", message),
			ProtocolError::Remote { message } => write!(f, "Peer error: {}", message),
			ProtocolError::Disconnected => write!(f, "Connection closed unexpectedly"),
			ProtocolError::Timeout => write!(f, "Connection timeout"),
			ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
	fn from(e: io::Error) -> Self {
		match e.kind() {
			io::ErrorKind::UnexpectedEof => ProtocolError::Disconnected,
			_ => ProtocolError::Io(e),
		}
	}
}

impl From<serde_json::Error> for ProtocolError {
	fn from(e: serde_json::Error) -> Self {
		ProtocolError::Decode { message: e.to_string() }
	}
}

/// Transfer verification errors
#[derive(Debug)]
pub enum TransferError {
	/// Received byte count does not match the announced size
	SizeMismatch { path: String, expected: u64, actual: u64 },

	/// Recomputed fingerprint does not match the announced hash
	HashMismatch { path: String, expected: String, actual: String },
}

impl fmt::Display for TransferError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransferError::SizeMismatch { path, expected, actual } => {
				write!(f, "Size mismatch for {}: expected {}, got {}", path, expected, actual)
			}
			TransferError::HashMismatch { path, expected, actual } => {
				write!(f, "Hash mismatch for {}: expected {}, got {}", path, expected, actual)
			}
		}
	}
}

impl Error for TransferError {}

// vim: ts=4
