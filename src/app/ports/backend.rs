// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{Job, Principal};

/// RPC contract of a computation backend. The concrete scheduling glue
/// (Slurm over SSH, container runtimes, cloud providers) lives behind this
/// trait, out of tree.
#[async_trait]
pub trait ComputeBackendPort: Send + Sync {
    /// Pre-flight notification; the backend may reject the job here, which
    /// aborts submission before anything is persisted.
    async fn job_verified(&self, job: &Job) -> AppResult<()>;

    /// "Begin scheduling now." The backend later proposes SCHEDULED/RUNNING
    /// on its own.
    async fn job_prepared(&self, job: &Job) -> AppResult<()>;

    async fn cancel(&self, job: &Job) -> AppResult<()>;

    /// Errors from cleanup are logged by the caller, never propagated.
    async fn cleanup(&self, job: &Job) -> AppResult<()>;

    /// Whether staging goes through an isolated workspace instead of direct
    /// transfer.
    fn use_workspaces(&self) -> bool;
}

/// Resolves a backend name to its handle and checks callers claiming to act
/// as a backend.
pub trait BackendRegistryPort: Send + Sync {
    fn resolve(&self, name: &str) -> AppResult<Arc<dyn ComputeBackendPort>>;

    fn verify_caller(
        &self,
        name: &str,
        caller: &Principal,
    ) -> AppResult<Arc<dyn ComputeBackendPort>>;
}
