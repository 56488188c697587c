// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use time::OffsetDateTime;

use crate::adapters::db::{JobStore, JobStoreError};
use crate::app::errors::{codes, AppError, AppErrorKind, AppResult};
use crate::app::ports::JobStorePort;
use crate::app::state::JobState;
use crate::app::types::JobWithCredentials;

const SCAN_PAGE_SIZE: i64 = 64;

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<JobStore>,
}

impl SqliteStoreAdapter {
    pub fn new(store: JobStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// SqliteStoreAdapter is an outbound adapter implementing ports, so it is the
/// place where persistence-specific errors (JobStoreError, sqlx) become
/// app-level errors and the domain core stays free of DB details.
fn map_store_error(err: JobStoreError) -> AppError {
    match err {
        JobStoreError::Duplicate(id) => AppError::with_message(
            AppErrorKind::Conflict,
            codes::CONFLICT,
            format!("a job with id '{id}' already exists"),
        ),
        JobStoreError::JobNotFound(id) => AppError::with_message(
            AppErrorKind::NotFound,
            codes::NOT_FOUND,
            format!("job {id} not found"),
        ),
        other => AppError::new(AppErrorKind::Internal, codes::INTERNAL_ERROR)
            .with_context(other.to_string()),
    }
}

struct ScanCursor {
    before: OffsetDateTime,
    last_id: Option<String>,
    buffered: VecDeque<JobWithCredentials>,
    exhausted: bool,
}

#[async_trait]
impl JobStorePort for SqliteStoreAdapter {
    async fn create(&self, job: &JobWithCredentials) -> AppResult<()> {
        self.store.create(job).await.map_err(map_store_error)
    }

    async fn update_state_and_status(
        &self,
        job_id: &str,
        state: JobState,
        status: Option<&str>,
        failed_state: Option<JobState>,
    ) -> AppResult<()> {
        self.store
            .update_state_and_status(job_id, state, status, failed_state)
            .await
            .map_err(map_store_error)
    }

    async fn update_status(&self, job_id: &str, status: &str) -> AppResult<()> {
        self.store
            .update_status(job_id, status)
            .await
            .map_err(map_store_error)
    }

    async fn update_workspace(&self, job_id: &str, workspace: &str) -> AppResult<()> {
        self.store
            .update_workspace(job_id, workspace)
            .await
            .map_err(map_store_error)
    }

    async fn find_or_null(
        &self,
        job_id: &str,
        owner: Option<&str>,
    ) -> AppResult<Option<JobWithCredentials>> {
        self.store
            .find_or_null(job_id, owner)
            .await
            .map_err(map_store_error)
    }

    fn find_created_before(
        &self,
        before: OffsetDateTime,
    ) -> BoxStream<'static, AppResult<JobWithCredentials>> {
        let store = self.store.clone();
        let cursor = ScanCursor {
            before,
            last_id: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        Box::pin(stream::try_unfold(
            (store, cursor),
            |(store, mut cursor)| async move {
                loop {
                    if let Some(item) = cursor.buffered.pop_front() {
                        return Ok(Some((item, (store, cursor))));
                    }
                    if cursor.exhausted {
                        return Ok(None);
                    }
                    let page = store
                        .list_created_before(
                            cursor.before,
                            cursor.last_id.as_deref(),
                            SCAN_PAGE_SIZE,
                        )
                        .await
                        .map_err(map_store_error)?;
                    if (page.len() as i64) < SCAN_PAGE_SIZE {
                        cursor.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        cursor.last_id = Some(last.job.id.clone());
                    }
                    cursor.buffered.extend(page);
                }
            },
        ))
    }
}
