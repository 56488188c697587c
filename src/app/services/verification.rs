// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashSet;
use std::path::Component;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::app::errors::{codes, AppError, AppErrorKind, AppResult};
use crate::app::ports::{ClockPort, VerifierPort};
use crate::app::state::JobState;
use crate::app::types::{
    AppRef, Credentials, Job, JobWithCredentials, Reservation, StagedFile, ToolRef, UnverifiedJob,
};

const MAX_NAME_LENGTH: usize = 128;
const MAX_WALL_TIME_SECONDS: u64 = 60 * 60 * 24 * 30;

/// Catalog-less verifier: validates the shape of a submission and mints the
/// job record. Resolution against a real application store happens upstream;
/// callers that already resolved a tool pass it through the submission.
pub struct JobVerifier {
    clock: Arc<dyn ClockPort>,
}

impl JobVerifier {
    pub fn new(clock: Arc<dyn ClockPort>) -> Self {
        Self { clock }
    }
}

fn verification_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Verification, codes::VERIFICATION_ERROR, message)
}

fn require_relative(field: &str, value: &str) -> AppResult<()> {
    if value.is_empty() {
        return Err(verification_error(format!("{field} must not be empty")));
    }
    let path = Path::new(value);
    if path.is_absolute() {
        return Err(verification_error(format!(
            "{field} must be relative, got '{value}'"
        )));
    }
    if path
        .components()
        .any(|part| matches!(part, Component::ParentDir))
    {
        return Err(verification_error(format!(
            "{field} must not contain '..', got '{value}'"
        )));
    }
    Ok(())
}

fn check_files(field: &str, files: &[StagedFile], seen: &mut HashSet<String>) -> AppResult<()> {
    for (index, file) in files.iter().enumerate() {
        if file.source_path.trim().is_empty() {
            return Err(verification_error(format!(
                "{field}[{index}].source_path must not be empty"
            )));
        }
        require_relative(
            &format!("{field}[{index}].destination_path"),
            &file.destination_path,
        )?;
        if !seen.insert(file.destination_path.clone()) {
            return Err(verification_error(format!(
                "{field}[{index}].destination_path '{}' is declared twice",
                file.destination_path
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl VerifierPort for JobVerifier {
    async fn verify(
        &self,
        unverified: UnverifiedJob,
        credentials: Credentials,
    ) -> AppResult<JobWithCredentials> {
        let submission = unverified.submission;

        if submission.application_name.trim().is_empty() {
            return Err(verification_error("application.name must not be empty"));
        }
        if submission.application_version.trim().is_empty() {
            return Err(verification_error("application.version must not be empty"));
        }

        if let Some(name) = submission.name.as_deref() {
            if name.is_empty() || name.len() > MAX_NAME_LENGTH {
                return Err(verification_error(format!(
                    "name must be between 1 and {MAX_NAME_LENGTH} characters"
                )));
            }
            if !name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
            {
                return Err(verification_error(
                    "name may only contain letters, digits, '-' and '_'",
                ));
            }
        }

        if submission.nodes == 0 {
            return Err(verification_error("nodes must be at least 1"));
        }
        if submission.tasks_per_node == 0 {
            return Err(verification_error("tasks_per_node must be at least 1"));
        }
        if submission.max_time_seconds == 0 {
            return Err(verification_error("max_time_seconds must be at least 1"));
        }
        if submission.max_time_seconds > MAX_WALL_TIME_SECONDS {
            return Err(verification_error(format!(
                "max_time_seconds exceeds the maximum of {MAX_WALL_TIME_SECONDS}"
            )));
        }

        let mut destinations = HashSet::new();
        check_files("input_files", &submission.input_files, &mut destinations)?;
        check_files("mounts", &submission.mounts, &mut destinations)?;

        for (index, peer) in submission.peers.iter().enumerate() {
            if peer.name.trim().is_empty() {
                return Err(verification_error(format!(
                    "peers[{index}].name must not be empty"
                )));
            }
            if peer.job_id.trim().is_empty() {
                return Err(verification_error(format!(
                    "peers[{index}].job_id must not be empty"
                )));
            }
        }

        for (index, mount) in submission.shared_mounts.iter().enumerate() {
            if mount.source_path.trim().is_empty() {
                return Err(verification_error(format!(
                    "shared_mounts[{index}].source_path must not be empty"
                )));
            }
            require_relative(
                &format!("shared_mounts[{index}].mount_path"),
                &mount.mount_path,
            )?;
        }

        let application = AppRef {
            name: submission.application_name.clone(),
            version: submission.application_version.clone(),
        };
        let tool = match (submission.tool_name, submission.tool_version) {
            (Some(name), Some(version)) => ToolRef { name, version },
            (Some(name), None) => ToolRef {
                name,
                version: application.version.clone(),
            },
            _ => ToolRef {
                name: application.name.clone(),
                version: application.version.clone(),
            },
        };

        let now = self.clock.now_utc();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            owner: unverified.owner.username,
            project: unverified.project,
            name: submission.name,
            application,
            tool,
            backend: unverified.backend,
            workspace: None,
            reservation: Reservation {
                nodes: submission.nodes,
                tasks_per_node: submission.tasks_per_node,
                max_time_seconds: submission.max_time_seconds,
            },
            parameters: submission.parameters,
            input_files: submission.input_files,
            mounts: submission.mounts,
            peers: submission.peers,
            shared_mounts: submission.shared_mounts,
            state: JobState::Validated,
            failed_state: None,
            status: "Verified".to_string(),
            created_at: now,
            modified_at: now,
            started_at: None,
        };

        Ok(JobWithCredentials { job, credentials })
    }
}
