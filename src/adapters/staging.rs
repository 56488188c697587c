// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::app::errors::{codes, AppError, AppErrorKind, AppResult};
use crate::app::ports::{FileData, FileStagingPort};
use crate::app::types::Job;

/// Staging on a local filesystem tree:
///
/// ```text
/// <root>/results/<job_id>/          output handed back to the owner
/// <root>/backend/<backend>/<job_id> direct-transfer staging area
/// <root>/workspaces/<workspace_id>/ isolated workspaces (output/ inside)
/// ```
///
/// Remote staging (SSH, object storage) implements the same port out of
/// tree.
pub struct LocalStaging {
    root: PathBuf,
}

impl LocalStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn results_dir(&self, job: &Job) -> PathBuf {
        self.root.join("results").join(&job.id)
    }

    fn direct_dir(&self, job: &Job) -> PathBuf {
        self.root.join("backend").join(&job.backend).join(&job.id)
    }

    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.root.join("workspaces").join(workspace)
    }
}

fn local_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Internal, codes::INTERNAL_ERROR, message)
}

fn sanitize_relative(raw: &str) -> AppResult<PathBuf> {
    let path = Path::new(raw);
    if raw.is_empty() || path.is_absolute() {
        return Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            format!("'{raw}' is not a relative path"),
        ));
    }
    if path
        .components()
        .any(|part| !matches!(part, Component::Normal(_)))
    {
        return Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            format!("'{raw}' escapes the job directory"),
        ));
    }
    Ok(path.to_path_buf())
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl FileStagingPort for LocalStaging {
    async fn initialize_result_folder(&self, job: &Job, is_replay: bool) -> AppResult<()> {
        let dir = self.results_dir(job);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| local_error(format!("failed to prepare results root: {err}")))?;
        }
        match fs::create_dir(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if is_replay {
                    tracing::debug!(job_id = %job.id, "result folder already present, resuming");
                    Ok(())
                } else {
                    Err(AppError::with_message(
                        AppErrorKind::Conflict,
                        codes::CONFLICT,
                        format!("result folder for job {} already exists", job.id),
                    ))
                }
            }
            Err(err) => Err(local_error(format!(
                "failed to create result folder {}: {err}",
                dir.display()
            ))),
        }
    }

    async fn transfer_files_to_backend(&self, job: &Job) -> AppResult<()> {
        let staging_dir = self.direct_dir(job);
        fs::create_dir_all(&staging_dir)
            .map_err(|err| local_error(format!("failed to prepare staging area: {err}")))?;

        for file in &job.input_files {
            let destination = staging_dir.join(sanitize_relative(&file.destination_path)?);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| local_error(format!("failed to create {}: {err}", parent.display())))?;
            }
            match fs::copy(&file.source_path, &destination) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(AppError::with_message(
                        AppErrorKind::NotFound,
                        codes::NOT_FOUND,
                        format!("input file '{}' does not exist", file.source_path),
                    ));
                }
                Err(err) => {
                    return Err(local_error(format!(
                        "failed to stage '{}': {err}",
                        file.source_path
                    )));
                }
            }
        }
        Ok(())
    }

    async fn create_workspace(&self, job: &Job) -> AppResult<String> {
        let workspace = format!("ws-{}", Uuid::new_v4());
        let dir = self.workspace_dir(&workspace);
        fs::create_dir_all(dir.join("output"))
            .map_err(|err| local_error(format!("failed to create workspace: {err}")))?;

        for file in &job.input_files {
            let destination = dir.join(sanitize_relative(&file.destination_path)?);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| local_error(format!("failed to create {}: {err}", parent.display())))?;
            }
            match fs::copy(&file.source_path, &destination) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(AppError::with_message(
                        AppErrorKind::NotFound,
                        codes::NOT_FOUND,
                        format!("input file '{}' does not exist", file.source_path),
                    ));
                }
                Err(err) => {
                    return Err(local_error(format!(
                        "failed to stage '{}': {err}",
                        file.source_path
                    )));
                }
            }
        }

        tracing::debug!(job_id = %job.id, workspace, "workspace created");
        Ok(workspace)
    }

    async fn transfer_workspace(&self, job: &Job, is_replay: bool) -> AppResult<()> {
        let Some(workspace) = job.workspace.as_deref() else {
            if is_replay {
                return Ok(());
            }
            return Err(local_error(format!(
                "job {} has no workspace to transfer",
                job.id
            )));
        };

        let output = self.workspace_dir(workspace).join("output");
        if !output.is_dir() {
            // Nothing produced (yet); an earlier partially-completed transfer
            // also lands here after its source was consumed.
            return Ok(());
        }

        let results = self.results_dir(job);
        fs::create_dir_all(&results)
            .map_err(|err| local_error(format!("failed to prepare results folder: {err}")))?;
        copy_dir(&output, &results).map_err(|err| {
            local_error(format!(
                "failed to transfer workspace output for job {}: {err}",
                job.id
            ))
        })?;
        Ok(())
    }

    async fn accept_file(
        &self,
        job: &Job,
        relative_path: &str,
        length: u64,
        mut data: FileData,
        needs_extraction: bool,
    ) -> AppResult<()> {
        let rel = sanitize_relative(relative_path)?;
        let results = self.results_dir(job);
        let target = results.join(&rel);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| results.clone());
        fs::create_dir_all(&parent)
            .map_err(|err| local_error(format!("failed to create {}: {err}", parent.display())))?;

        let staged = parent.join(format!(".incoming-{}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&staged)
            .await
            .map_err(|err| local_error(format!("failed to open {}: {err}", staged.display())))?;
        let copied = tokio::io::copy(&mut data, &mut file)
            .await
            .map_err(|err| local_error(format!("failed to receive '{relative_path}': {err}")))?;
        file.flush()
            .await
            .map_err(|err| local_error(format!("failed to flush '{relative_path}': {err}")))?;
        drop(file);

        if copied != length {
            let _ = fs::remove_file(&staged);
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("'{relative_path}' declared {length} bytes but delivered {copied}"),
            ));
        }

        if needs_extraction {
            let archive_path = staged.clone();
            let extract_into = parent.clone();
            let unpacked = tokio::task::spawn_blocking(move || -> io::Result<()> {
                let archive_file = fs::File::open(&archive_path)?;
                let mut archive = tar::Archive::new(archive_file);
                archive.unpack(&extract_into)?;
                Ok(())
            })
            .await
            .map_err(|err| local_error(format!("extraction task failed: {err}")))?;
            let _ = fs::remove_file(&staged);
            unpacked.map_err(|err| {
                local_error(format!("failed to extract '{relative_path}': {err}"))
            })?;
        } else {
            fs::rename(&staged, &target).map_err(|err| {
                local_error(format!(
                    "failed to move '{relative_path}' into place: {err}"
                ))
            })?;
        }

        tracing::debug!(job_id = %job.id, path = relative_path, length, "accepted output file");
        Ok(())
    }
}
