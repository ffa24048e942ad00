//! # syncbox - client/server directory synchronizer
//!
//! One authoritative server keeps the canonical copy of a directory tree;
//! clients push local changes or pull remote ones over an authenticated,
//! optionally compressed framed TCP channel. Deletions propagate through
//! tombstones, concurrent edits surface as conflicts instead of silent
//! overwrites, and every server commit strictly advances a global version.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use syncbox::config::Config;
//! use syncbox::connect;
//! use syncbox::plan::{ConflictStrategy, SyncMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), syncbox::SyncError> {
//!     let config = Config::load(None)?;
//!     let outcome = connect::run_sync(&config, SyncMode::Push, ConflictStrategy::Ask).await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod connect;
pub mod error;
pub mod logging;
pub mod plan;
pub mod protocol;
pub mod scan;
pub mod serve;
pub mod state;
pub mod util;

// Re-export commonly used types
pub use error::{ConfigError, ProtocolError, StateError, SyncError, TransferError};
pub use plan::{Action, Conflict, ConflictKind, ConflictStrategy, SyncMode, SyncPlan};
pub use state::{FileEntry, FileStatus, SyncState};

// vim: ts=4
