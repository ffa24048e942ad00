//! Protocol command tokens and payload types
//!
//! Commands travel as the ASCII `cmd` section of a frame; payloads are UTF-8
//! JSON in the `data` section, except `FILE_CHUNK` frames, which carry one
//! raw body slice of a large transfer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::plan::{Action, Adoption, Conflict, ConflictStrategy, SyncMode};
use crate::state::SyncState;

/// Negotiated protocol version
pub const PROTOCOL_VERSION: u32 = 2;

/// Whole-file frames are used up to this size; larger bodies stream as
/// chunk frames
pub const SMALL_FILE_LIMIT: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
	Hello,
	Ok,
	Error,
	Conflict,
	GetState,
	SyncRequest,
	FileData,
	FileChunk,
	DeleteFile,
	SyncComplete,
}

impl Command {
	pub fn token(&self) -> &'static str {
		match self {
			Command::Hello => "HELLO",
			Command::Ok => "OK",
			Command::Error => "ERROR",
			Command::Conflict => "CONFLICT",
			Command::GetState => "GET_STATE",
			Command::SyncRequest => "SYNC_REQUEST",
			Command::FileData => "FILE_DATA",
			Command::FileChunk => "FILE_CHUNK",
			Command::DeleteFile => "DELETE_FILE",
			Command::SyncComplete => "SYNC_COMPLETE",
		}
	}

	pub fn parse(token: &str) -> Result<Command, ProtocolError> {
		match token {
			"HELLO" => Ok(Command::Hello),
			"OK" => Ok(Command::Ok),
			"ERROR" => Ok(Command::Error),
			"CONFLICT" => Ok(Command::Conflict),
			"GET_STATE" => Ok(Command::GetState),
			"SYNC_REQUEST" => Ok(Command::SyncRequest),
			"FILE_DATA" => Ok(Command::FileData),
			"FILE_CHUNK" => Ok(Command::FileChunk),
			"DELETE_FILE" => Ok(Command::DeleteFile),
			"SYNC_COMPLETE" => Ok(Command::SyncComplete),
			_ => Err(ProtocolError::UnknownCommand { token: token.to_string() }),
		}
	}
}

impl std::fmt::Display for Command {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.token())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
	pub client_id: String,
	pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPayload {
	pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
	pub mode: SyncMode,
	pub local_state: SyncState,
	pub base_version: u64,
	pub conflict_strategy: ConflictStrategy,
}

/// `OK` payload answering a `SYNC_REQUEST`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPayload {
	pub actions: Vec<Action>,
	pub adopts: Vec<Adoption>,
}

/// `FILE_DATA` payload.
///
/// Small files embed their content as base64 in `body` with `chunks = 0`;
/// large files announce `chunks` follow-up `FILE_CHUNK` frames instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDataPayload {
	pub path: String,
	pub size: u64,
	pub hash: String,
	pub version: u64,
	pub modified: u64,
	pub chunks: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFilePayload {
	pub path: String,
	pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCompletePayload {
	pub new_state_digest: String,
}

/// `OK` payload answering a `SYNC_COMPLETE`: the committed global version
/// and the server-assigned version per touched path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
	pub sync_version: u64,
	#[serde(default)]
	pub files: BTreeMap<String, u64>,
}


// vim: ts=4
