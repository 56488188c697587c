// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use time::OffsetDateTime;

use crate::app::errors::AppResult;
use crate::app::state::JobState;
use crate::app::types::JobWithCredentials;

/// Transactional persistence for job records.
///
/// Per-job transition writes are serialized by the store's conditional
/// update semantics; the orchestrator holds no in-process lock so multiple
/// daemon instances may share one store.
#[async_trait]
pub trait JobStorePort: Send + Sync {
    /// Fails when a job with the same id already exists.
    async fn create(&self, job: &JobWithCredentials) -> AppResult<()>;

    /// Updates state, optionally status, and the failed-state marker in one
    /// write. Stamps `modified_at`, and `started_at` the first time the job
    /// enters RUNNING. Not-found when no row matches.
    async fn update_state_and_status(
        &self,
        job_id: &str,
        state: JobState,
        status: Option<&str>,
        failed_state: Option<JobState>,
    ) -> AppResult<()>;

    async fn update_status(&self, job_id: &str, status: &str) -> AppResult<()>;

    async fn update_workspace(&self, job_id: &str, workspace: &str) -> AppResult<()>;

    /// Point lookup, optionally scoped to an owner.
    async fn find_or_null(
        &self,
        job_id: &str,
        owner: Option<&str>,
    ) -> AppResult<Option<JobWithCredentials>>;

    /// Lazy, restartable sequence of non-terminal jobs created before the
    /// given instant. Used by startup replay and by the expiry reaper.
    fn find_created_before(
        &self,
        before: OffsetDateTime,
    ) -> BoxStream<'static, AppResult<JobWithCredentials>>;
}
