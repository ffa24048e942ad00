//! Plan computation: diff two states into transfers, deletions and conflicts
//!
//! Plan computation is pure and deterministic: the same local state, remote
//! state, mode, strategy and base version always yield the same plan. The
//! caller decides what to do with the result; nothing here touches disk or
//! network.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::state::{FileEntry, SyncState};

/// Direction of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
	/// Client changes flow to the server
	Push,

	/// Server changes flow to the client
	Pull,
}

impl FromStr for SyncMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"push" => Ok(Self::Push),
			"pull" => Ok(Self::Pull),
			_ => Err(format!("Unknown sync mode: {}. Valid options: push, pull", s)),
		}
	}
}

impl fmt::Display for SyncMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Push => write!(f, "push"),
			Self::Pull => write!(f, "pull"),
		}
	}
}

/// What to do with detected conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
	/// Surface the conflict set and abort the session without mutation
	#[default]
	Ask,

	/// The local side wins: upload or delete-remote on push, skip on pull
	Local,

	/// The remote side wins: skip on push, download or delete-local on pull
	Remote,

	/// Drop conflicting entries from the plan, leave both sides untouched
	Skip,
}

impl FromStr for ConflictStrategy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"ask" => Ok(Self::Ask),
			"local" => Ok(Self::Local),
			"remote" => Ok(Self::Remote),
			"skip" => Ok(Self::Skip),
			_ => Err(format!(
				"Unknown conflict strategy: {}. Valid options: ask, local, remote, skip",
				s
			)),
		}
	}
}

impl fmt::Display for ConflictStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ask => write!(f, "ask"),
			Self::Local => write!(f, "local"),
			Self::Remote => write!(f, "remote"),
			Self::Skip => write!(f, "skip"),
		}
	}
}

/// Classification of a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
	/// Both sides changed the content since the common base
	ConcurrentEdit,

	/// Locally deleted while the remote side edited
	LocalDeleteRemoteEdit,

	/// Remotely deleted while the local side kept or edited the file
	RemoteDeleted,
}

impl fmt::Display for ConflictKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::ConcurrentEdit => write!(f, "concurrent-edit"),
			Self::LocalDeleteRemoteEdit => write!(f, "local-delete-remote-edit"),
			Self::RemoteDeleted => write!(f, "remote-deleted"),
		}
	}
}

/// One unresolved conflict in a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
	pub path: String,
	pub kind: ConflictKind,
	pub detail: String,
}

/// One planned operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
	Upload { path: String },
	Download { path: String },
	DeleteRemote { path: String, version: u64 },
	DeleteLocal { path: String, version: u64 },
}

impl Action {
	pub fn path(&self) -> &str {
		match self {
			Action::Upload { path }
			| Action::Download { path }
			| Action::DeleteRemote { path, .. }
			| Action::DeleteLocal { path, .. } => path,
		}
	}
}

/// Version convergence for an equal-content path: no transfer, the client
/// adopts the higher version number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adoption {
	pub path: String,
	pub version: u64,
}

/// The computed plan for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncPlan {
	pub actions: Vec<Action>,
	pub adopts: Vec<Adoption>,
	pub conflicts: Vec<Conflict>,
}

impl SyncPlan {
	pub fn is_empty(&self) -> bool {
		self.actions.is_empty() && self.adopts.is_empty() && self.conflicts.is_empty()
	}

	pub fn has_conflicts(&self) -> bool {
		!self.conflicts.is_empty()
	}
}

/// Compute the plan for a session.
///
/// `local` is the side initiating the session (the client), `remote` the
/// authoritative server state, `base_version` the server version observed at
/// the end of the client's last successful session.
pub fn plan(
	local: &SyncState,
	remote: &SyncState,
	mode: SyncMode,
	strategy: ConflictStrategy,
	base_version: u64,
) -> SyncPlan {
	let diverged = base_version < remote.sync_version;
	let mut out = SyncPlan::default();

	let paths: BTreeSet<&String> = local.files.keys().chain(remote.files.keys()).collect();

	for path in paths {
		let l = local.files.get(path);
		let r = remote.files.get(path);
		match mode {
			SyncMode::Push => plan_push_path(&mut out, path, l, r, diverged, strategy),
			SyncMode::Pull => plan_pull_path(&mut out, path, l, r, diverged, strategy),
		}
	}

	out
}

fn plan_push_path(
	out: &mut SyncPlan,
	path: &str,
	l: Option<&FileEntry>,
	r: Option<&FileEntry>,
	diverged: bool,
	strategy: ConflictStrategy,
) {
	match (l, r) {
		(Some(l), None) if l.is_active() => {
			out.actions.push(Action::Upload { path: path.to_string() });
		}
		// Local tombstone for a path the server never saw: nothing to delete
		(Some(_), None) => {}
		// Only pull may delete locally
		(None, Some(_)) => {}
		(None, None) => {}
		(Some(l), Some(r)) => match (l.is_active(), r.is_active()) {
			(true, true) => {
				if l.hash == r.hash {
					if l.version != r.version {
						out.adopts.push(Adoption {
							path: path.to_string(),
							version: l.version.max(r.version),
						});
					}
				} else if l.version > r.version || !diverged {
					out.actions.push(Action::Upload { path: path.to_string() });
				} else {
					resolve_push_conflict(
						out,
						strategy,
						l,
						Conflict {
							path: path.to_string(),
							kind: ConflictKind::ConcurrentEdit,
							detail: format!(
								"local v{} and remote v{} changed concurrently",
								l.version, r.version
							),
						},
					);
				}
			}
			(false, true) => {
				if l.version > r.version {
					out.actions.push(Action::DeleteRemote {
						path: path.to_string(),
						version: l.version,
					});
				} else {
					resolve_push_conflict(
						out,
						strategy,
						l,
						Conflict {
							path: path.to_string(),
							kind: ConflictKind::LocalDeleteRemoteEdit,
							detail: format!(
								"deleted locally at v{} but remote edited to v{}",
								l.version, r.version
							),
						},
					);
				}
			}
			(true, false) => {
				if l.version > r.version {
					// Resurrects the remotely deleted path
					out.actions.push(Action::Upload { path: path.to_string() });
				} else {
					resolve_push_conflict(
						out,
						strategy,
						l,
						Conflict {
							path: path.to_string(),
							kind: ConflictKind::RemoteDeleted,
							detail: format!(
								"remote deleted at v{}, local kept v{}",
								r.version, l.version
							),
						},
					);
				}
			}
			(false, false) => {
				if l.version != r.version {
					out.adopts.push(Adoption {
						path: path.to_string(),
						version: l.version.max(r.version),
					});
				}
			}
		},
	}
}

fn plan_pull_path(
	out: &mut SyncPlan,
	path: &str,
	l: Option<&FileEntry>,
	r: Option<&FileEntry>,
	diverged: bool,
	strategy: ConflictStrategy,
) {
	match (l, r) {
		(None, Some(r)) if r.is_active() => {
			out.actions.push(Action::Download { path: path.to_string() });
		}
		// Server tombstone for a path this client never had
		(None, Some(_)) => {}
		// Local-only path: pull never uploads
		(Some(_), None) => {}
		(None, None) => {}
		(Some(l), Some(r)) => match (l.is_active(), r.is_active()) {
			(true, true) => {
				if l.hash == r.hash {
					if l.version != r.version {
						out.adopts.push(Adoption {
							path: path.to_string(),
							version: l.version.max(r.version),
						});
					}
				} else if l.version > r.version || !diverged {
					// The local side dominates, or the server cannot have
					// moved since the base: a pending local edit, push's
					// business
				} else {
					// Mirrors the push decision: diverged and the remote
					// version dominates. `remote` resolves to the download.
					resolve_pull_conflict(
						out,
						strategy,
						r,
						Conflict {
							path: path.to_string(),
							kind: ConflictKind::ConcurrentEdit,
							detail: format!(
								"local v{} and remote v{} changed concurrently",
								l.version, r.version
							),
						},
					);
				}
			}
			(true, false) => {
				if r.version > l.version {
					out.actions.push(Action::DeleteLocal {
						path: path.to_string(),
						version: r.version,
					});
				} else {
					resolve_pull_conflict(
						out,
						strategy,
						r,
						Conflict {
							path: path.to_string(),
							kind: ConflictKind::RemoteDeleted,
							detail: format!(
								"remote deleted at v{}, local kept v{}",
								r.version, l.version
							),
						},
					);
				}
			}
			(false, true) => {
				if r.version > l.version {
					out.actions.push(Action::Download { path: path.to_string() });
				} else {
					resolve_pull_conflict(
						out,
						strategy,
						r,
						Conflict {
							path: path.to_string(),
							kind: ConflictKind::LocalDeleteRemoteEdit,
							detail: format!(
								"deleted locally at v{} but remote edited to v{}",
								l.version, r.version
							),
						},
					);
				}
			}
			(false, false) => {
				if l.version != r.version {
					out.adopts.push(Adoption {
						path: path.to_string(),
						version: l.version.max(r.version),
					});
				}
			}
		},
	}
}

fn resolve_push_conflict(
	out: &mut SyncPlan,
	strategy: ConflictStrategy,
	l: &FileEntry,
	conflict: Conflict,
) {
	match strategy {
		ConflictStrategy::Ask => out.conflicts.push(conflict),
		// Remote wins or skip: the push leaves the entry alone either way
		ConflictStrategy::Remote | ConflictStrategy::Skip => {}
		ConflictStrategy::Local => match conflict.kind {
			ConflictKind::ConcurrentEdit | ConflictKind::RemoteDeleted => {
				out.actions.push(Action::Upload { path: conflict.path });
			}
			ConflictKind::LocalDeleteRemoteEdit => {
				out.actions.push(Action::DeleteRemote { path: conflict.path, version: l.version });
			}
		},
	}
}

fn resolve_pull_conflict(
	out: &mut SyncPlan,
	strategy: ConflictStrategy,
	r: &FileEntry,
	conflict: Conflict,
) {
	match strategy {
		ConflictStrategy::Ask => out.conflicts.push(conflict),
		// Local wins or skip: the pull leaves the entry alone either way
		ConflictStrategy::Local | ConflictStrategy::Skip => {}
		ConflictStrategy::Remote => match conflict.kind {
			ConflictKind::ConcurrentEdit | ConflictKind::LocalDeleteRemoteEdit => {
				out.actions.push(Action::Download { path: conflict.path });
			}
			ConflictKind::RemoteDeleted => {
				out.actions.push(Action::DeleteLocal { path: conflict.path, version: r.version });
			}
		},
	}
}


// vim: ts=4
