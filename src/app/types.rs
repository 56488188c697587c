// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::app::state::JobState;

/// Application name plus version, the unit users submit against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRef {
    pub name: String,
    pub version: String,
}

/// Tool reference resolved during verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRef {
    pub name: String,
    pub version: String,
}

/// Requested compute resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub nodes: u32,
    pub tasks_per_node: u32,
    pub max_time_seconds: u64,
}

/// A file declared for staging: where it lives in the user's storage and
/// where it lands relative to the job's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub source_path: String,
    pub destination_path: String,
    pub read_only: bool,
}

/// Link to another job whose working directory should be visible to this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    pub name: String,
    pub job_id: String,
}

/// A shared filesystem mounted into the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMount {
    pub source_path: String,
    pub mount_path: String,
}

/// Opaque token pair used to act on behalf of the owner during staging.
/// Stored alongside the job, never part of its public identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// An authenticated caller: a user or a backend's service identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// The central entity. Created once per submission, never deleted; it reaches
/// a terminal state and is retained for historical query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub owner: String,
    pub project: Option<String>,
    pub name: Option<String>,
    pub application: AppRef,
    pub tool: ToolRef,
    pub backend: String,
    pub workspace: Option<String>,
    pub reservation: Reservation,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub input_files: Vec<StagedFile>,
    pub mounts: Vec<StagedFile>,
    pub peers: Vec<PeerLink>,
    pub shared_mounts: Vec<SharedMount>,
    pub state: JobState,
    pub failed_state: Option<JobState>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub modified_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
}

/// A job together with the credential pair persisted next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWithCredentials {
    pub job: Job,
    pub credentials: Credentials,
}

/// "Job X should move to state Y." The unit of work the state machine
/// consumes; never persisted independently of being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStateChange {
    pub job_id: String,
    pub new_state: JobState,
}

/// Raw submission payload before verification.
#[derive(Debug, Clone, Default)]
pub struct JobSubmission {
    pub application_name: String,
    pub application_version: String,
    /// Resolved by the caller's application catalog; defaults to the
    /// application reference itself when absent.
    pub tool_name: Option<String>,
    pub tool_version: Option<String>,
    pub backend: Option<String>,
    pub name: Option<String>,
    pub nodes: u32,
    pub tasks_per_node: u32,
    pub max_time_seconds: u64,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub input_files: Vec<StagedFile>,
    pub mounts: Vec<StagedFile>,
    pub peers: Vec<PeerLink>,
    pub shared_mounts: Vec<SharedMount>,
}

/// Submission bound to a caller identity and a resolved backend, ready for
/// verification.
#[derive(Debug, Clone)]
pub struct UnverifiedJob {
    pub submission: JobSubmission,
    pub owner: Principal,
    pub project: Option<String>,
    pub backend: String,
}

/// Fire-and-forget event emitted once per completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingEvent {
    pub job_id: String,
    pub owner: String,
    pub duration_ms: i64,
    pub nodes: u32,
    pub completed_at_ms: i64,
    pub application: AppRef,
    pub success: bool,
}
