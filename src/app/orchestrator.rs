// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use time::{Duration, OffsetDateTime};

use crate::app::errors::{codes, AppError, AppErrorKind, AppResult};
use crate::app::ports::{
    AccountingPort, BackendRegistryPort, ClockPort, FileData, FileStagingPort, JobStorePort,
    TaskHandle, TaskSpawnerPort, VerifierPort,
};
use crate::app::state::JobState;
use crate::app::types::{
    AccountingEvent, Credentials, JobStateChange, JobSubmission, JobWithCredentials, Principal,
    UnverifiedJob,
};

/// Identity behind a proposed state change: exactly one of the job's bound
/// backend or the owning user.
#[derive(Debug, Clone)]
pub enum StateChangeCaller {
    Backend(Principal),
    Owner(Principal),
}

/// Owns the lifecycle of jobs across computation backends.
///
/// The orchestrator receives lifecycle events through its methods, either
/// from user action (submitting, canceling) or from backend callbacks (state
/// proposals, completion, output files). In reaction it updates the persisted
/// job record and drives per-state side effects: staging input on VALIDATED,
/// notifying the backend on PREPARED, preparing output folders on
/// CANCELING/TRANSFER_SUCCESS, and backend cleanup on the terminal states.
///
/// Any failure while processing a job forces that job into FAILURE through
/// the same driver, so a broken backend can never leave a record stuck in a
/// non-terminal state with nobody responsible for it.
///
/// `replay_lost_jobs` must run in exactly one process per job store;
/// concurrent replay from two daemons is not defended against.
#[derive(Clone)]
pub struct JobOrchestrator {
    jobs: Arc<dyn JobStorePort>,
    backends: Arc<dyn BackendRegistryPort>,
    staging: Arc<dyn FileStagingPort>,
    verifier: Arc<dyn VerifierPort>,
    accounting: Arc<dyn AccountingPort>,
    clock: Arc<dyn ClockPort>,
    spawner: Arc<dyn TaskSpawnerPort>,
    default_backend: String,
    max_job_age: Duration,
}

impl JobOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStorePort>,
        backends: Arc<dyn BackendRegistryPort>,
        staging: Arc<dyn FileStagingPort>,
        verifier: Arc<dyn VerifierPort>,
        accounting: Arc<dyn AccountingPort>,
        clock: Arc<dyn ClockPort>,
        spawner: Arc<dyn TaskSpawnerPort>,
        default_backend: String,
        max_job_age: Duration,
    ) -> Self {
        Self {
            jobs,
            backends,
            staging,
            verifier,
            accounting,
            clock,
            spawner,
            default_backend,
            max_job_age,
        }
    }

    /// Validates and persists a submission, then starts driving it through
    /// the state machine. Returns the job id without waiting for completion.
    pub async fn start_job(
        &self,
        submission: JobSubmission,
        principal: Principal,
        project: Option<String>,
        credentials: Credentials,
    ) -> AppResult<String> {
        let backend_name = submission
            .backend
            .clone()
            .unwrap_or_else(|| self.default_backend.clone());
        let backend = self.backends.resolve(&backend_name)?;

        tracing::debug!(
            application = %submission.application_name,
            version = %submission.application_version,
            backend = %backend_name,
            "verifying job submission"
        );
        let unverified = UnverifiedJob {
            submission,
            owner: principal,
            project,
            backend: backend_name,
        };
        let verified = self.verifier.verify(unverified, credentials).await?;
        let job_id = verified.job.id.clone();

        // The backend may reject here; nothing has been persisted yet.
        backend.job_verified(&verified.job).await?;

        self.jobs.create(&verified).await?;
        tracing::debug!(job_id, "job persisted, entering state machine");

        let entry = JobStateChange {
            job_id: job_id.clone(),
            new_state: JobState::Validated,
        };
        let _driver = self.spawn_change(verified, entry, None, false).await;

        Ok(job_id)
    }

    /// Proposed transition from a backend or from the owning user. Checks the
    /// transition table and, when legal and not a no-op, runs the driver.
    /// For TRANSFER_SUCCESS the call does not return until the driver work
    /// for that transition completed, so backends that treat completion as
    /// synchronous get an accurate signal.
    pub async fn handle_proposed_state_change(
        &self,
        event: JobStateChange,
        new_status: Option<String>,
        caller: StateChangeCaller,
    ) -> AppResult<()> {
        let jwc = self.find_for_caller(&event.job_id, &caller).await?;
        let job_id = event.job_id.clone();
        let target = event.new_state;

        match self.propose_checked(jwc, event, new_status, &caller).await {
            Ok(Some(handle)) => {
                if target == JobState::TransferSuccess {
                    handle.join().await;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => self.fail_job_on_error(&job_id, err, true).await,
        }
    }

    /// Updates the free-text status only. Failures here never fail the job.
    pub async fn handle_add_status(
        &self,
        job_id: &str,
        message: &str,
        backend_caller: &Principal,
    ) -> AppResult<()> {
        let jwc = self.find_job(job_id, None).await?;
        self.backends.verify_caller(&jwc.job.backend, backend_caller)?;
        self.jobs.update_status(job_id, message).await
    }

    /// Final result reported by the backend. Drives the terminal transition
    /// and emits exactly one accounting event after it succeeded.
    pub async fn handle_job_complete(
        &self,
        job_id: &str,
        wall_duration: Option<Duration>,
        success: bool,
        backend_caller: &Principal,
    ) -> AppResult<()> {
        let result = self
            .job_complete_inner(job_id, wall_duration, success, backend_caller)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.fail_job_on_error(job_id, err, true).await,
        }
    }

    async fn job_complete_inner(
        &self,
        job_id: &str,
        wall_duration: Option<Duration>,
        success: bool,
        backend_caller: &Principal,
    ) -> AppResult<()> {
        let jwc = self.find_job(job_id, None).await?;
        let now = self.clock.now_utc();

        let actual_duration = wall_duration.unwrap_or_else(|| match jwc.job.started_at {
            Some(started_at) => now - started_at,
            // Job finished before it was ever reported running.
            None => Duration::seconds(5),
        });
        let duration_ms = actual_duration.whole_milliseconds() as i64;
        tracing::debug!(job_id, duration_ms, success, "job completed");

        let event = JobStateChange {
            job_id: job_id.to_string(),
            new_state: if success {
                JobState::Success
            } else {
                JobState::Failure
            },
        };
        let caller = StateChangeCaller::Backend(backend_caller.clone());
        let owner = jwc.job.owner.clone();
        let nodes = jwc.job.reservation.nodes;
        let application = jwc.job.application.clone();

        if let Some(handle) = self.propose_checked(jwc, event, None, &caller).await? {
            handle.join().await;
        }

        self.accounting.emit(AccountingEvent {
            job_id: job_id.to_string(),
            owner,
            duration_ms,
            nodes,
            completed_at_ms: epoch_ms(now),
            application,
            success,
        });
        Ok(())
    }

    /// Accepts an output file produced mid-run.
    pub async fn handle_incoming_file(
        &self,
        job_id: &str,
        backend_caller: &Principal,
        relative_path: &str,
        length: u64,
        data: FileData,
        needs_extraction: bool,
    ) -> AppResult<()> {
        let result: AppResult<()> = async {
            let jwc = self.find_job(job_id, None).await?;
            self.backends.verify_caller(&jwc.job.backend, backend_caller)?;
            self.staging
                .accept_file(&jwc.job, relative_path, length, data, needs_extraction)
                .await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.fail_job_on_error(job_id, err, true).await,
        }
    }

    /// Re-drives every job left in a non-terminal state by a previous process
    /// lifetime. Must run before accepting traffic, in exactly one process.
    pub async fn replay_lost_jobs(&self) -> AppResult<()> {
        tracing::info!("replaying jobs lost from the previous session");
        let mut count: u64 = 0;
        let mut stream = self.jobs.find_created_before(self.clock.now_utc());
        while let Some(next) = stream.next().await {
            let jwc = match next {
                Ok(jwc) => jwc,
                Err(err) => {
                    tracing::warn!("skipping unreadable job record during replay: {err}");
                    continue;
                }
            };
            count += 1;
            let event = JobStateChange {
                job_id: jwc.job.id.clone(),
                new_state: jwc.job.state,
            };
            let _driver = self.spawn_change(jwc, event, None, true).await;
        }
        tracing::info!("replay finished, recovered {count} jobs");
        Ok(())
    }

    /// Backstop against backends that silently stop reporting: forces every
    /// job older than the configured maximum age into FAILURE.
    pub async fn remove_expired_jobs(&self) -> AppResult<()> {
        let cutoff = self.clock.now_utc() - self.max_job_age;
        let mut count: u64 = 0;
        let mut stream = self.jobs.find_created_before(cutoff);
        while let Some(next) = stream.next().await {
            let jwc = match next {
                Ok(jwc) => jwc,
                Err(err) => {
                    tracing::warn!("skipping unreadable job record during expiry sweep: {err}");
                    continue;
                }
            };
            tracing::info!(job_id = %jwc.job.id, state = %jwc.job.state, "expiring job past maximum age");
            count += 1;
            self.fail_job(&jwc).await;
        }
        if count > 0 {
            tracing::info!("expired {count} jobs past the maximum age");
        }
        Ok(())
    }

    // --- internals ---

    async fn find_job(&self, job_id: &str, owner: Option<&str>) -> AppResult<JobWithCredentials> {
        self.jobs.find_or_null(job_id, owner).await?.ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("job {job_id} not found"),
            )
        })
    }

    async fn find_for_caller(
        &self,
        job_id: &str,
        caller: &StateChangeCaller,
    ) -> AppResult<JobWithCredentials> {
        match caller {
            StateChangeCaller::Backend(_) => self.find_job(job_id, None).await,
            StateChangeCaller::Owner(principal) => {
                self.find_job(job_id, Some(&principal.username)).await
            }
        }
    }

    /// Authorization and transition-table check. Returns the driver handle
    /// when the proposal was legal and actually moved the job; `None` for the
    /// accepted no-ops (legal self-loop, late cancellation of a finished
    /// job).
    async fn propose_checked(
        &self,
        jwc: JobWithCredentials,
        event: JobStateChange,
        new_status: Option<String>,
        caller: &StateChangeCaller,
    ) -> AppResult<Option<TaskHandle>> {
        if let StateChangeCaller::Backend(principal) = caller {
            self.backends.verify_caller(&jwc.job.backend, principal)?;
        }

        let current = jwc.job.state;
        let proposed = event.new_state;

        if current.can_transition_to(proposed) {
            if proposed == current {
                return Ok(None);
            }
            let handle = self.spawn_change(jwc, event, new_status, false).await;
            return Ok(Some(handle));
        }

        // Cancellation racing with natural completion must not surface as an
        // error to the caller.
        if proposed == JobState::Canceling && current.is_final() {
            tracing::debug!(job_id = %event.job_id, state = %current, "ignoring late cancellation of a finished job");
            return Ok(None);
        }

        Err(AppError::with_message(
            AppErrorKind::BadStateTransition,
            codes::BAD_STATE_TRANSITION,
            format!(
                "cannot move job {} from {current} to {proposed}",
                event.job_id
            ),
        ))
    }

    /// Launches the transition driver on the spawner and hands back its
    /// handle. Driver failures go through the non-propagating failure path;
    /// they never crash the host task.
    async fn spawn_change(
        &self,
        jwc: JobWithCredentials,
        event: JobStateChange,
        status: Option<String>,
        is_replay: bool,
    ) -> TaskHandle {
        let this = self.clone();
        let job_id = event.job_id.clone();
        self.spawner
            .spawn(Box::pin(async move {
                if let Err(err) = this.drive(jwc, event, status, is_replay).await {
                    let _ = this.fail_job_on_error(&job_id, err, false).await;
                }
            }))
            .await
    }

    fn drive(
        &self,
        jwc: JobWithCredentials,
        event: JobStateChange,
        status: Option<String>,
        is_replay: bool,
    ) -> BoxFuture<'static, AppResult<()>> {
        let this = self.clone();
        Box::pin(async move { this.drive_inner(jwc, event, status, is_replay).await })
    }

    /// The transition driver: persists the new (state, status, failed-state)
    /// tuple, then performs the state's side effect. Replay skips the
    /// persistence write and resumes side effects only.
    async fn drive_inner(
        &self,
        mut jwc: JobWithCredentials,
        event: JobStateChange,
        status: Option<String>,
        is_replay: bool,
    ) -> AppResult<()> {
        let failed_state = if event.new_state == JobState::Failure
            && jwc.job.state != JobState::Failure
        {
            Some(jwc.job.state)
        } else {
            None
        };

        if !is_replay {
            self.jobs
                .update_state_and_status(
                    &event.job_id,
                    event.new_state,
                    status.as_deref(),
                    failed_state,
                )
                .await?;
        }

        let backend = self.backends.resolve(&jwc.job.backend)?;

        match event.new_state {
            JobState::Validated => {
                if backend.use_workspaces() {
                    if jwc.job.workspace.is_none() {
                        let workspace = self.staging.create_workspace(&jwc.job).await?;
                        self.jobs.update_workspace(&event.job_id, &workspace).await?;
                        jwc.job.workspace = Some(workspace);
                    }
                } else {
                    self.staging.transfer_files_to_backend(&jwc.job).await?;
                }

                // Input is in place; move straight on. This is a call back
                // into the driver and inherits the surrounding guard.
                let next = JobStateChange {
                    job_id: event.job_id.clone(),
                    new_state: JobState::Prepared,
                };
                let next_status =
                    Some("Your job is currently in the process of being scheduled.".to_string());
                self.drive(jwc, next, next_status, false).await?;
            }

            JobState::Prepared => {
                backend.job_prepared(&jwc.job).await?;
            }

            JobState::Scheduled | JobState::Running => {
                // Nothing beyond the state/status write.
            }

            JobState::Canceling | JobState::TransferSuccess => {
                self.staging
                    .initialize_result_folder(&jwc.job, is_replay)
                    .await?;

                if backend.use_workspaces() {
                    let this = self.clone();
                    let job_id = event.job_id.clone();
                    let transfer_job = jwc.clone();
                    // Output moves back in the background; callers that need
                    // it joined wait on the driver handle instead.
                    let _transfer = self
                        .spawner
                        .spawn(Box::pin(async move {
                            if let Err(err) = this
                                .staging
                                .transfer_workspace(&transfer_job.job, is_replay)
                                .await
                            {
                                let _ = this.fail_job_on_error(&job_id, err, false).await;
                            }
                        }))
                        .await;
                }

                if event.new_state == JobState::Canceling {
                    backend.cancel(&jwc.job).await?;
                }
            }

            JobState::Success | JobState::Failure => {
                if jwc.job.state == JobState::Canceling && !is_replay {
                    self.jobs
                        .update_state_and_status(
                            &event.job_id,
                            event.new_state,
                            Some("Job canceled successfully."),
                            failed_state,
                        )
                        .await?;
                }

                // Cleanup runs after the terminal state is recorded; its
                // failures never escalate and never mask the outcome.
                if let Err(err) = backend.cleanup(&jwc.job).await {
                    tracing::info!(job_id = %event.job_id, "backend cleanup failed: {err}");
                }
            }
        }

        Ok(())
    }

    /// The failure policy shared by every lifecycle entry point: classify the
    /// error, record it as the job's status, force FAILURE through the normal
    /// driver so cleanup still runs, then hand the original error back unless
    /// the call site runs in non-propagating mode.
    async fn fail_job_on_error(
        &self,
        job_id: &str,
        err: AppError,
        propagate: bool,
    ) -> AppResult<()> {
        let status = if err.kind() != AppErrorKind::Internal {
            tracing::debug!(job_id, "job operation failed: {err}");
            err.message().to_string()
        } else {
            tracing::warn!(job_id, "unexpected error while handling job operation: {err}");
            "Internal error".to_string()
        };

        let recorded: AppResult<()> = async {
            self.jobs.update_status(job_id, &status).await?;
            if let Some(existing) = self.jobs.find_or_null(job_id, None).await? {
                self.fail_job(&existing).await;
            }
            Ok(())
        }
        .await;
        if let Err(record_err) = recorded {
            // Most likely the job does not exist; there is nothing to fail.
            tracing::info!(job_id, "could not record failure: {record_err}");
        }

        if propagate {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Forces a job into FAILURE. Checking the current state first keeps a
    /// crash while already failing from looping, and a finished job keeps its
    /// recorded outcome.
    fn fail_job(&self, existing: &JobWithCredentials) -> BoxFuture<'static, ()> {
        let this = self.clone();
        let existing = existing.clone();
        Box::pin(async move {
            if existing.job.state.is_final() {
                return;
            }
            let event = JobStateChange {
                job_id: existing.job.id.clone(),
                new_state: JobState::Failure,
            };
            let _driver = this.spawn_change(existing.clone(), event, None, false).await;
        })
    }
}

fn epoch_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{ComputeBackendPort, InlineSpawner};
    use crate::app::services::backends::BackendRegistry;
    use crate::app::services::verification::JobVerifier;
    use crate::app::types::{Job, StagedFile};
    use async_trait::async_trait;
    use futures_util::stream;
    use futures_util::stream::BoxStream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const BASE_TIME: i64 = 1_754_000_000;

    struct FixedClock {
        now: Mutex<OffsetDateTime>,
    }

    impl FixedClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(OffsetDateTime::from_unix_timestamp(BASE_TIME).unwrap()),
            }
        }

        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl ClockPort for FixedClock {
        fn now_utc(&self) -> OffsetDateTime {
            *self.now.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct FakeJobStore {
        rows: Mutex<HashMap<String, JobWithCredentials>>,
        state_writes: Mutex<Vec<(String, JobState)>>,
    }

    impl FakeJobStore {
        fn get(&self, job_id: &str) -> Job {
            self.rows.lock().unwrap().get(job_id).unwrap().job.clone()
        }

        fn state_writes_for(&self, job_id: &str) -> Vec<JobState> {
            self.state_writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == job_id)
                .map(|(_, state)| *state)
                .collect()
        }
    }

    #[async_trait]
    impl JobStorePort for FakeJobStore {
        async fn create(&self, job: &JobWithCredentials) -> AppResult<()> {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&job.job.id) {
                return Err(AppError::with_message(
                    AppErrorKind::Conflict,
                    codes::CONFLICT,
                    format!("job {} already exists", job.job.id),
                ));
            }
            rows.insert(job.job.id.clone(), job.clone());
            Ok(())
        }

        async fn update_state_and_status(
            &self,
            job_id: &str,
            state: JobState,
            status: Option<&str>,
            failed_state: Option<JobState>,
        ) -> AppResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(job_id).ok_or_else(|| {
                AppError::new(AppErrorKind::NotFound, codes::NOT_FOUND)
            })?;
            row.job.state = state;
            row.job.failed_state = failed_state;
            if let Some(status) = status {
                row.job.status = status.to_string();
            }
            row.job.modified_at += Duration::seconds(1);
            if state == JobState::Running && row.job.started_at.is_none() {
                row.job.started_at = Some(row.job.modified_at);
            }
            self.state_writes
                .lock()
                .unwrap()
                .push((job_id.to_string(), state));
            Ok(())
        }

        async fn update_status(&self, job_id: &str, status: &str) -> AppResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(job_id).ok_or_else(|| {
                AppError::new(AppErrorKind::NotFound, codes::NOT_FOUND)
            })?;
            row.job.status = status.to_string();
            row.job.modified_at += Duration::seconds(1);
            Ok(())
        }

        async fn update_workspace(&self, job_id: &str, workspace: &str) -> AppResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(job_id).ok_or_else(|| {
                AppError::new(AppErrorKind::NotFound, codes::NOT_FOUND)
            })?;
            row.job.workspace = Some(workspace.to_string());
            row.job.modified_at += Duration::seconds(1);
            Ok(())
        }

        async fn find_or_null(
            &self,
            job_id: &str,
            owner: Option<&str>,
        ) -> AppResult<Option<JobWithCredentials>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.get(job_id).cloned().filter(|jwc| match owner {
                Some(owner) => jwc.job.owner == owner,
                None => true,
            }))
        }

        fn find_created_before(
            &self,
            before: OffsetDateTime,
        ) -> BoxStream<'static, AppResult<JobWithCredentials>> {
            let mut items: Vec<JobWithCredentials> = self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|jwc| !jwc.job.state.is_final() && jwc.job.created_at < before)
                .cloned()
                .collect();
            items.sort_by(|a, b| a.job.id.cmp(&b.job.id));
            Box::pin(stream::iter(items.into_iter().map(Ok)))
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        workspaces: bool,
        reject_verified: AtomicBool,
        fail_prepared: AtomicBool,
        fail_cleanup: AtomicBool,
    }

    impl FakeBackend {
        fn with_workspaces() -> Self {
            Self {
                workspaces: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl ComputeBackendPort for FakeBackend {
        async fn job_verified(&self, job: &Job) -> AppResult<()> {
            self.record(format!("job_verified:{}", job.id));
            if self.reject_verified.load(Ordering::SeqCst) {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    "backend rejected the job",
                ));
            }
            Ok(())
        }

        async fn job_prepared(&self, job: &Job) -> AppResult<()> {
            self.record(format!("job_prepared:{}", job.id));
            if self.fail_prepared.load(Ordering::SeqCst) {
                return Err(AppError::with_message(
                    AppErrorKind::Internal,
                    codes::INTERNAL_ERROR,
                    "scheduler unreachable",
                ));
            }
            Ok(())
        }

        async fn cancel(&self, job: &Job) -> AppResult<()> {
            self.record(format!("cancel:{}", job.id));
            Ok(())
        }

        async fn cleanup(&self, job: &Job) -> AppResult<()> {
            self.record(format!("cleanup:{}", job.id));
            if self.fail_cleanup.load(Ordering::SeqCst) {
                return Err(AppError::with_message(
                    AppErrorKind::Internal,
                    codes::INTERNAL_ERROR,
                    "cleanup exploded",
                ));
            }
            Ok(())
        }

        fn use_workspaces(&self) -> bool {
            self.workspaces
        }
    }

    #[derive(Default)]
    struct FakeStaging {
        calls: Mutex<Vec<String>>,
        folders: Mutex<std::collections::HashSet<String>>,
        fail_transfer: AtomicBool,
    }

    impl FakeStaging {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl FileStagingPort for FakeStaging {
        async fn initialize_result_folder(&self, job: &Job, is_replay: bool) -> AppResult<()> {
            let fresh = self.folders.lock().unwrap().insert(job.id.clone());
            if !fresh && !is_replay {
                return Err(AppError::with_message(
                    AppErrorKind::Conflict,
                    codes::CONFLICT,
                    format!("result folder for job {} already exists", job.id),
                ));
            }
            self.record(format!("init_folder:{}:replay={is_replay}", job.id));
            Ok(())
        }

        async fn transfer_files_to_backend(&self, job: &Job) -> AppResult<()> {
            if self.fail_transfer.load(Ordering::SeqCst) {
                return Err(AppError::with_message(
                    AppErrorKind::Internal,
                    codes::INTERNAL_ERROR,
                    "file transfer failed",
                ));
            }
            self.record(format!("transfer_files:{}", job.id));
            Ok(())
        }

        async fn create_workspace(&self, job: &Job) -> AppResult<String> {
            self.record(format!("create_workspace:{}", job.id));
            Ok(format!("ws-{}", job.id))
        }

        async fn transfer_workspace(&self, job: &Job, is_replay: bool) -> AppResult<()> {
            self.record(format!("transfer_workspace:{}:replay={is_replay}", job.id));
            Ok(())
        }

        async fn accept_file(
            &self,
            job: &Job,
            relative_path: &str,
            length: u64,
            _data: FileData,
            needs_extraction: bool,
        ) -> AppResult<()> {
            self.record(format!(
                "accept_file:{}:{relative_path}:{length}:{needs_extraction}",
                job.id
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingAccounting {
        events: Mutex<Vec<AccountingEvent>>,
    }

    impl AccountingPort for CollectingAccounting {
        fn emit(&self, event: AccountingEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        orchestrator: JobOrchestrator,
        store: Arc<FakeJobStore>,
        backend: Arc<FakeBackend>,
        staging: Arc<FakeStaging>,
        accounting: Arc<CollectingAccounting>,
        clock: Arc<FixedClock>,
    }

    fn harness_with_backend(backend: FakeBackend) -> Harness {
        let store = Arc::new(FakeJobStore::default());
        let backend = Arc::new(backend);
        let staging = Arc::new(FakeStaging::default());
        let accounting = Arc::new(CollectingAccounting::default());
        let clock = Arc::new(FixedClock::new());

        let mut registry = BackendRegistry::new();
        registry.register("slurm", "slurm-service", backend.clone());

        let orchestrator = JobOrchestrator::new(
            store.clone(),
            Arc::new(registry),
            staging.clone(),
            Arc::new(JobVerifier::new(clock.clone())),
            accounting.clone(),
            clock.clone(),
            Arc::new(InlineSpawner),
            "slurm".to_string(),
            Duration::hours(48),
        );

        Harness {
            orchestrator,
            store,
            backend,
            staging,
            accounting,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with_backend(FakeBackend::default())
    }

    fn submission() -> JobSubmission {
        JobSubmission {
            application_name: "gromacs".into(),
            application_version: "2024.1".into(),
            nodes: 1,
            tasks_per_node: 1,
            max_time_seconds: 3600,
            input_files: vec![StagedFile {
                source_path: "/home/alice/input.tpr".into(),
                destination_path: "input.tpr".into(),
                read_only: true,
            }],
            ..JobSubmission::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
        }
    }

    fn backend_principal() -> Principal {
        Principal::new("slurm-service")
    }

    async fn submit(h: &Harness) -> String {
        h.orchestrator
            .start_job(
                submission(),
                Principal::new("alice"),
                Some("bio".into()),
                credentials(),
            )
            .await
            .unwrap()
    }

    async fn propose(h: &Harness, job_id: &str, state: JobState) -> AppResult<()> {
        h.orchestrator
            .handle_proposed_state_change(
                JobStateChange {
                    job_id: job_id.to_string(),
                    new_state: state,
                },
                None,
                StateChangeCaller::Backend(backend_principal()),
            )
            .await
    }

    #[tokio::test]
    async fn start_job_stages_input_and_reaches_prepared() {
        let h = harness();
        let job_id = submit(&h).await;

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Prepared);
        assert_eq!(
            h.backend.calls(),
            vec![
                format!("job_verified:{job_id}"),
                format!("job_prepared:{job_id}")
            ]
        );
        assert_eq!(h.staging.calls(), vec![format!("transfer_files:{job_id}")]);
        assert_eq!(
            h.store.state_writes_for(&job_id),
            vec![JobState::Validated, JobState::Prepared]
        );
    }

    #[tokio::test]
    async fn workspace_backend_gets_a_workspace_instead_of_direct_transfer() {
        let h = harness_with_backend(FakeBackend::with_workspaces());
        let job_id = submit(&h).await;

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Prepared);
        assert_eq!(job.workspace.as_deref(), Some(format!("ws-{job_id}").as_str()));
        assert_eq!(
            h.staging.calls(),
            vec![format!("create_workspace:{job_id}")]
        );
    }

    #[tokio::test]
    async fn backend_rejection_aborts_before_anything_is_persisted() {
        let h = harness();
        h.backend.reject_verified.store(true, Ordering::SeqCst);

        let err = h
            .orchestrator
            .start_job(
                submission(),
                Principal::new("alice"),
                None,
                credentials(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.message(), "backend rejected the job");
        assert!(h.store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_submission_never_reaches_the_backend() {
        let h = harness();
        let mut bad = submission();
        bad.nodes = 0;

        let err = h
            .orchestrator
            .start_job(bad, Principal::new("alice"), None, credentials())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), AppErrorKind::Verification);
        assert!(h.backend.calls().is_empty());
        assert!(h.store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn running_sets_started_at_exactly_once() {
        let h = harness();
        let job_id = submit(&h).await;

        propose(&h, &job_id, JobState::Scheduled).await.unwrap();
        propose(&h, &job_id, JobState::Running).await.unwrap();

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn transfer_success_blocks_until_the_result_folder_exists() {
        let h = harness();
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();

        propose(&h, &job_id, JobState::TransferSuccess).await.unwrap();

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::TransferSuccess);
        assert!(h
            .staging
            .calls()
            .contains(&format!("init_folder:{job_id}:replay=false")));
    }

    #[tokio::test]
    async fn late_cancellation_of_a_finished_job_is_a_silent_noop() {
        let h = harness();
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();
        h.orchestrator
            .handle_job_complete(&job_id, None, true, &backend_principal())
            .await
            .unwrap();

        let before = h.store.get(&job_id);
        assert_eq!(before.state, JobState::Success);

        let result = h
            .orchestrator
            .handle_proposed_state_change(
                JobStateChange {
                    job_id: job_id.clone(),
                    new_state: JobState::Canceling,
                },
                None,
                StateChangeCaller::Owner(Principal::new("alice")),
            )
            .await;
        assert!(result.is_ok());

        let after = h.store.get(&job_id);
        assert_eq!(after.state, JobState::Success);
        assert_eq!(after.modified_at, before.modified_at);
        assert_eq!(after.status, before.status);
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected_and_the_failure_self_loop_is_not() {
        let h = harness();
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();
        h.orchestrator
            .handle_job_complete(&job_id, None, false, &backend_principal())
            .await
            .unwrap();
        assert_eq!(h.store.get(&job_id).state, JobState::Failure);

        let err = propose(&h, &job_id, JobState::Running).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::BadStateTransition);

        // A crash while already failing must not raise a second error.
        propose(&h, &job_id, JobState::Failure).await.unwrap();
        assert_eq!(h.store.get(&job_id).state, JobState::Failure);
    }

    #[tokio::test]
    async fn unauthorized_backend_identity_is_rejected() {
        let h = harness();
        let job_id = submit(&h).await;

        let err = h
            .orchestrator
            .handle_proposed_state_change(
                JobStateChange {
                    job_id: job_id.clone(),
                    new_state: JobState::Running,
                },
                None,
                StateChangeCaller::Backend(Principal::new("intruder")),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), AppErrorKind::Unauthorized);
        // The guard records the rejection against the job.
        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Failure);
        assert!(job.status.contains("not authorized"));
    }

    #[tokio::test]
    async fn owner_lookup_is_scoped_to_the_owner() {
        let h = harness();
        let job_id = submit(&h).await;

        let err = h
            .orchestrator
            .handle_proposed_state_change(
                JobStateChange {
                    job_id: job_id.clone(),
                    new_state: JobState::Canceling,
                },
                None,
                StateChangeCaller::Owner(Principal::new("mallory")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::NotFound);
        // A failed lookup must not touch the job.
        assert_eq!(h.store.get(&job_id).state, JobState::Prepared);
    }

    #[tokio::test]
    async fn failed_completion_records_failed_state_and_one_accounting_event() {
        let h = harness();
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();
        h.clock.advance(Duration::seconds(90));

        h.orchestrator
            .handle_job_complete(&job_id, None, false, &backend_principal())
            .await
            .unwrap();

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Failure);
        assert_eq!(job.failed_state, Some(JobState::Running));
        assert!(h.backend.calls().contains(&format!("cleanup:{job_id}")));

        let events = h.accounting.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert_eq!(events[0].job_id, job_id);
        assert_eq!(events[0].nodes, 1);
        assert!(events[0].duration_ms > 0);
    }

    #[tokio::test]
    async fn direct_transfer_job_end_to_end() {
        let h = harness();
        let job_id = submit(&h).await;
        assert_eq!(h.store.get(&job_id).state, JobState::Prepared);

        propose(&h, &job_id, JobState::Running).await.unwrap();
        propose(&h, &job_id, JobState::TransferSuccess).await.unwrap();
        h.orchestrator
            .handle_job_complete(
                &job_id,
                Some(Duration::minutes(10)),
                true,
                &backend_principal(),
            )
            .await
            .unwrap();

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.failed_state, None);

        let events = h.accounting.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
        assert_eq!(events[0].duration_ms, 600_000);

        assert_eq!(
            h.backend.calls(),
            vec![
                format!("job_verified:{job_id}"),
                format!("job_prepared:{job_id}"),
                format!("cleanup:{job_id}"),
            ]
        );
    }

    #[tokio::test]
    async fn staging_failure_forces_the_job_into_failure() {
        let h = harness();
        h.staging.fail_transfer.store(true, Ordering::SeqCst);

        // The driver runs behind the spawner, so submission itself succeeds.
        let job_id = submit(&h).await;

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Failure);
        assert_eq!(job.failed_state, Some(JobState::Validated));
        assert_eq!(job.status, "Internal error");
        assert!(h.backend.calls().contains(&format!("cleanup:{job_id}")));
    }

    #[tokio::test]
    async fn backend_prepare_failure_fails_the_job() {
        let h = harness();
        h.backend.fail_prepared.store(true, Ordering::SeqCst);

        let job_id = submit(&h).await;

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Failure);
        assert_eq!(job.status, "Internal error");
        assert_eq!(job.failed_state, Some(JobState::Prepared));
    }

    #[tokio::test]
    async fn cancellation_runs_the_cancel_rpc_and_finishes_with_cancel_status() {
        let h = harness();
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();

        h.orchestrator
            .handle_proposed_state_change(
                JobStateChange {
                    job_id: job_id.clone(),
                    new_state: JobState::Canceling,
                },
                None,
                StateChangeCaller::Owner(Principal::new("alice")),
            )
            .await
            .unwrap();

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Canceling);
        assert!(h.backend.calls().contains(&format!("cancel:{job_id}")));
        assert!(h
            .staging
            .calls()
            .contains(&format!("init_folder:{job_id}:replay=false")));

        h.orchestrator
            .handle_job_complete(&job_id, None, true, &backend_principal())
            .await
            .unwrap();
        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.status, "Job canceled successfully.");
    }

    #[tokio::test]
    async fn replaying_transfer_success_tolerates_the_existing_folder() {
        let h = harness_with_backend(FakeBackend::with_workspaces());
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();
        propose(&h, &job_id, JobState::TransferSuccess).await.unwrap();

        let before = h.store.get(&job_id);
        let transfers_before = h
            .staging
            .calls()
            .iter()
            .filter(|call| call.starts_with("transfer_workspace"))
            .count();

        // Simulate a restart: drive the same state again as replay.
        h.clock.advance(Duration::seconds(30));
        h.orchestrator.replay_lost_jobs().await.unwrap();

        let after = h.store.get(&job_id);
        assert_eq!(after.state, JobState::TransferSuccess);
        assert_eq!(after.modified_at, before.modified_at);
        assert!(h
            .staging
            .calls()
            .contains(&format!("init_folder:{job_id}:replay=true")));
        let transfers_after = h
            .staging
            .calls()
            .iter()
            .filter(|call| call.starts_with("transfer_workspace"))
            .count();
        assert_eq!(transfers_after, transfers_before + 1);
        assert!(h
            .staging
            .calls()
            .contains(&format!("transfer_workspace:{job_id}:replay=true")));
    }

    #[tokio::test]
    async fn replay_ignores_terminal_jobs() {
        let h = harness();
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();
        h.orchestrator
            .handle_job_complete(&job_id, None, true, &backend_principal())
            .await
            .unwrap();

        let writes_before = h.store.state_writes_for(&job_id).len();
        h.clock.advance(Duration::seconds(30));
        h.orchestrator.replay_lost_jobs().await.unwrap();

        assert_eq!(h.store.state_writes_for(&job_id).len(), writes_before);
    }

    #[tokio::test]
    async fn expiry_reaper_fails_jobs_past_the_maximum_age() {
        let h = harness();
        let old_id = submit(&h).await;
        propose(&h, &old_id, JobState::Running).await.unwrap();

        h.clock.advance(Duration::hours(49));
        let fresh_id = submit(&h).await;

        h.orchestrator.remove_expired_jobs().await.unwrap();

        let old = h.store.get(&old_id);
        assert_eq!(old.state, JobState::Failure);
        assert_eq!(old.failed_state, Some(JobState::Running));

        let fresh = h.store.get(&fresh_id);
        assert_eq!(fresh.state, JobState::Prepared);
    }

    #[tokio::test]
    async fn add_status_touches_only_the_status_text() {
        let h = harness();
        let job_id = submit(&h).await;

        h.orchestrator
            .handle_add_status(&job_id, "12 of 100 frames done", &backend_principal())
            .await
            .unwrap();

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Prepared);
        assert_eq!(job.status, "12 of 100 frames done");

        let err = h
            .orchestrator
            .handle_add_status("missing", "x", &backend_principal())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::NotFound);
    }

    #[tokio::test]
    async fn incoming_files_are_handed_to_staging() {
        let h = harness();
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();

        let data: FileData = Box::new(std::io::Cursor::new(b"frame-0".to_vec()));
        h.orchestrator
            .handle_incoming_file(&job_id, &backend_principal(), "out/frame0.xtc", 7, data, false)
            .await
            .unwrap();

        assert!(h
            .staging
            .calls()
            .contains(&format!("accept_file:{job_id}:out/frame0.xtc:7:false")));
    }

    #[tokio::test]
    async fn cleanup_failures_never_mask_the_terminal_outcome() {
        let h = harness();
        h.backend.fail_cleanup.store(true, Ordering::SeqCst);
        let job_id = submit(&h).await;
        propose(&h, &job_id, JobState::Running).await.unwrap();

        h.orchestrator
            .handle_job_complete(&job_id, None, true, &backend_principal())
            .await
            .unwrap();

        let job = h.store.get(&job_id);
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.failed_state, None);
    }
}
