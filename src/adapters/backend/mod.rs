// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::ports::ComputeBackendPort;
use crate::app::types::Job;

/// Development backend: acknowledges the full RPC contract without
/// scheduling any real work. Lets the daemon run end-to-end on a laptop;
/// production backends (Slurm over SSH, container runtimes) implement the
/// same port out of tree and register under their own names.
pub struct DevBackend {
    name: String,
    workspaces: bool,
}

impl DevBackend {
    pub fn new(name: impl Into<String>, workspaces: bool) -> Self {
        Self {
            name: name.into(),
            workspaces,
        }
    }

    /// Service principal this backend authenticates callbacks with.
    pub fn principal(&self) -> String {
        format!("{}-service", self.name)
    }
}

#[async_trait]
impl ComputeBackendPort for DevBackend {
    async fn job_verified(&self, job: &Job) -> AppResult<()> {
        tracing::info!(backend = %self.name, job_id = %job.id, "job verified");
        Ok(())
    }

    async fn job_prepared(&self, job: &Job) -> AppResult<()> {
        tracing::info!(backend = %self.name, job_id = %job.id, "job ready to schedule");
        Ok(())
    }

    async fn cancel(&self, job: &Job) -> AppResult<()> {
        tracing::info!(backend = %self.name, job_id = %job.id, "cancellation requested");
        Ok(())
    }

    async fn cleanup(&self, job: &Job) -> AppResult<()> {
        tracing::info!(backend = %self.name, job_id = %job.id, "cleanup requested");
        Ok(())
    }

    fn use_workspaces(&self) -> bool {
        self.workspaces
    }
}
