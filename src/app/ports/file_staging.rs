// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::Job;

pub type FileData = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Moves job files into place: prepares working directories, stages input
/// either by direct transfer or through an isolated workspace, and later
/// brings output back to the user's storage.
#[async_trait]
pub trait FileStagingPort: Send + Sync {
    /// Creates the job's result output directory. On replay an existing
    /// directory is tolerated; live, it is a conflict.
    async fn initialize_result_folder(&self, job: &Job, is_replay: bool) -> AppResult<()>;

    /// Direct-mode staging: copy declared input files to the backend.
    async fn transfer_files_to_backend(&self, job: &Job) -> AppResult<()>;

    /// Isolated-mode staging: create a workspace and return its identifier.
    async fn create_workspace(&self, job: &Job) -> AppResult<String>;

    /// Output transfer back to user storage; tolerant of partially completed
    /// earlier attempts when replaying.
    async fn transfer_workspace(&self, job: &Job, is_replay: bool) -> AppResult<()>;

    /// Accept an output file produced mid-run.
    async fn accept_file(
        &self,
        job: &Job,
        relative_path: &str,
        length: u64,
        data: FileData,
        needs_extraction: bool,
    ) -> AppResult<()>;
}
