// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::BTreeMap, path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::app::state::JobState;
use crate::app::types::{
    AppRef, Credentials, Job, JobWithCredentials, PeerLink, Reservation, SharedMount, StagedFile,
    ToolRef,
};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] time::error::Parse),
    #[error("job already exists: {0}")]
    Duplicate(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("unknown job state '{0}' in database")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, JobStoreError>;

/// Async job store backed by SQLite.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    #[allow(dead_code)]
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        self.ensure_jobs_table().await?;
        Ok(())
    }

    async fn ensure_jobs_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              job_id TEXT PRIMARY KEY,
              owner TEXT NOT NULL,
              project TEXT,
              name TEXT,
              app_name TEXT NOT NULL,
              app_version TEXT NOT NULL,
              tool_name TEXT NOT NULL,
              tool_version TEXT NOT NULL,
              backend TEXT NOT NULL,
              workspace TEXT,
              nodes INTEGER NOT NULL,
              tasks_per_node INTEGER NOT NULL,
              max_time_seconds INTEGER NOT NULL,
              parameters TEXT NOT NULL,      -- JSON object
              input_files TEXT NOT NULL,     -- JSON array
              mounts TEXT NOT NULL,          -- JSON array
              peers TEXT NOT NULL,           -- JSON array
              shared_mounts TEXT NOT NULL,   -- JSON array
              access_token TEXT NOT NULL,
              refresh_token TEXT,
              state TEXT NOT NULL,
              failed_state TEXT,
              status TEXT NOT NULL,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              modified_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              started_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner);
            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a new job. Fails when the id is already taken.
    pub async fn create(&self, record: &JobWithCredentials) -> Result<()> {
        let job = &record.job;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs(
              job_id, owner, project, name,
              app_name, app_version, tool_name, tool_version,
              backend, workspace,
              nodes, tasks_per_node, max_time_seconds,
              parameters, input_files, mounts, peers, shared_mounts,
              access_token, refresh_token,
              state, failed_state, status,
              created_at, modified_at, started_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.owner)
        .bind(&job.project)
        .bind(&job.name)
        .bind(&job.application.name)
        .bind(&job.application.version)
        .bind(&job.tool.name)
        .bind(&job.tool.version)
        .bind(&job.backend)
        .bind(&job.workspace)
        .bind(job.reservation.nodes as i64)
        .bind(job.reservation.tasks_per_node as i64)
        .bind(job.reservation.max_time_seconds as i64)
        .bind(serde_json::to_string(&job.parameters)?)
        .bind(serde_json::to_string(&job.input_files)?)
        .bind(serde_json::to_string(&job.mounts)?)
        .bind(serde_json::to_string(&job.peers)?)
        .bind(serde_json::to_string(&job.shared_mounts)?)
        .bind(&record.credentials.access_token)
        .bind(&record.credentials.refresh_token)
        .bind(job.state.as_str())
        .bind(job.failed_state.map(JobState::as_str))
        .bind(&job.status)
        .bind(fmt_ts(job.created_at))
        .bind(fmt_ts(job.modified_at))
        .bind(job.started_at.map(fmt_ts))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(JobStoreError::Duplicate(job.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// One conditional write for state, optional status and failed-state
    /// marker. Stamps `modified_at`; `started_at` is stamped the first time
    /// the job enters RUNNING and never touched again.
    pub async fn update_state_and_status(
        &self,
        job_id: &str,
        state: JobState,
        status: Option<&str>,
        failed_state: Option<JobState>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
              state = ?1,
              status = COALESCE(?2, status),
              failed_state = ?3,
              modified_at = ?4,
              started_at = CASE
                WHEN ?1 = 'RUNNING' AND started_at IS NULL THEN ?4
                ELSE started_at
              END
            WHERE job_id = ?5
            "#,
        )
        .bind(state.as_str())
        .bind(status)
        .bind(failed_state.map(JobState::as_str))
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    pub async fn update_status(&self, job_id: &str, status: &str) -> Result<()> {
        let now = now_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?1, modified_at = ?2
            WHERE job_id = ?3
            "#,
        )
        .bind(status)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    pub async fn update_workspace(&self, job_id: &str, workspace: &str) -> Result<()> {
        let now = now_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET workspace = ?1, modified_at = ?2
            WHERE job_id = ?3
            "#,
        )
        .bind(workspace)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Point lookup, optionally scoped to an owner.
    pub async fn find_or_null(
        &self,
        job_id: &str,
        owner: Option<&str>,
    ) -> Result<Option<JobWithCredentials>> {
        let row = match owner {
            Some(owner) => {
                sqlx::query("SELECT * FROM jobs WHERE job_id = ? AND owner = ?")
                    .bind(job_id)
                    .bind(owner)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.map(row_to_job).transpose()
    }

    /// One page of non-terminal jobs created before the cutoff, ordered by
    /// job id. Passing the last id of the previous page makes the scan a
    /// restartable cursor.
    pub async fn list_created_before(
        &self,
        before: OffsetDateTime,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<JobWithCredentials>> {
        let cutoff = fmt_ts(before);
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE created_at < ?1
              AND state NOT IN ('SUCCESS', 'FAILURE')
              AND (?2 IS NULL OR job_id > ?2)
            ORDER BY job_id ASC
            LIMIT ?3
            "#,
        )
        .bind(cutoff)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }
}

// -- helpers

fn now_rfc3339() -> String {
    fmt_ts(OffsetDateTime::now_utc())
}

fn fmt_ts(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

fn parse_state(raw: String) -> Result<JobState> {
    JobState::from_str(&raw).map_err(|err| JobStoreError::InvalidState(err.value))
}

fn parse_ts(raw: &str) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::parse(raw, &Rfc3339)?)
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<JobWithCredentials> {
    let state = parse_state(row.try_get::<String, _>("state")?)?;
    let failed_state = row
        .try_get::<Option<String>, _>("failed_state")?
        .map(parse_state)
        .transpose()?;

    let created_at = parse_ts(&row.try_get::<String, _>("created_at")?)?;
    let modified_at = parse_ts(&row.try_get::<String, _>("modified_at")?)?;
    let started_at = row
        .try_get::<Option<String>, _>("started_at")?
        .as_deref()
        .map(parse_ts)
        .transpose()?;

    let parameters: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&row.try_get::<String, _>("parameters")?)?;
    let input_files: Vec<StagedFile> =
        serde_json::from_str(&row.try_get::<String, _>("input_files")?)?;
    let mounts: Vec<StagedFile> = serde_json::from_str(&row.try_get::<String, _>("mounts")?)?;
    let peers: Vec<PeerLink> = serde_json::from_str(&row.try_get::<String, _>("peers")?)?;
    let shared_mounts: Vec<SharedMount> =
        serde_json::from_str(&row.try_get::<String, _>("shared_mounts")?)?;

    let job = Job {
        id: row.try_get("job_id")?,
        owner: row.try_get("owner")?,
        project: row.try_get("project")?,
        name: row.try_get("name")?,
        application: AppRef {
            name: row.try_get("app_name")?,
            version: row.try_get("app_version")?,
        },
        tool: ToolRef {
            name: row.try_get("tool_name")?,
            version: row.try_get("tool_version")?,
        },
        backend: row.try_get("backend")?,
        workspace: row.try_get("workspace")?,
        reservation: Reservation {
            nodes: row.try_get::<i64, _>("nodes")? as u32,
            tasks_per_node: row.try_get::<i64, _>("tasks_per_node")? as u32,
            max_time_seconds: row.try_get::<i64, _>("max_time_seconds")? as u64,
        },
        parameters,
        input_files,
        mounts,
        peers,
        shared_mounts,
        state,
        failed_state,
        status: row.try_get("status")?,
        created_at,
        modified_at,
        started_at,
    };

    let credentials = Credentials {
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
    };

    Ok(JobWithCredentials { job, credentials })
}
