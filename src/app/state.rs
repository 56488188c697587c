// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::str::FromStr;

/// Lifecycle states of a job. `Success` and `Failure` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Validated,
    Prepared,
    Scheduled,
    Running,
    TransferSuccess,
    Canceling,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseJobStateError {
    pub value: String,
}

impl fmt::Display for ParseJobStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job state '{}'", self.value)
    }
}

impl std::error::Error for ParseJobStateError {}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Validated,
        JobState::Prepared,
        JobState::Scheduled,
        JobState::Running,
        JobState::TransferSuccess,
        JobState::Canceling,
        JobState::Success,
        JobState::Failure,
    ];

    pub fn is_final(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Validated => "VALIDATED",
            JobState::Prepared => "PREPARED",
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::TransferSuccess => "TRANSFER_SUCCESS",
            JobState::Canceling => "CANCELING",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        }
    }

    /// The transition lattice. A proposal is legal only if the destination is
    /// listed for the current state. SCHEDULED may be skipped for quick jobs,
    /// every non-terminal state may move to CANCELING, and FAILURE permits a
    /// self-loop so a crash while already failing does not raise a second
    /// unhandled error.
    pub fn allowed_transitions(self) -> &'static [JobState] {
        match self {
            JobState::Validated => &[
                JobState::Prepared,
                JobState::Canceling,
                JobState::Success,
                JobState::Failure,
            ],
            JobState::Prepared => &[
                JobState::Scheduled,
                JobState::Running,
                JobState::TransferSuccess,
                JobState::Canceling,
                JobState::Success,
                JobState::Failure,
            ],
            JobState::Scheduled => &[
                JobState::Running,
                JobState::TransferSuccess,
                JobState::Canceling,
                JobState::Success,
                JobState::Failure,
            ],
            JobState::Running => &[
                JobState::TransferSuccess,
                JobState::Success,
                JobState::Failure,
                JobState::Canceling,
            ],
            JobState::TransferSuccess => {
                &[JobState::Success, JobState::Failure, JobState::Canceling]
            }
            JobState::Canceling => &[JobState::Success, JobState::Failure],
            JobState::Failure => &[JobState::Failure],
            JobState::Success => &[],
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALIDATED" => Ok(JobState::Validated),
            "PREPARED" => Ok(JobState::Prepared),
            "SCHEDULED" => Ok(JobState::Scheduled),
            "RUNNING" => Ok(JobState::Running),
            "TRANSFER_SUCCESS" => Ok(JobState::TransferSuccess),
            "CANCELING" => Ok(JobState::Canceling),
            "SUCCESS" => Ok(JobState::Success),
            "FAILURE" => Ok(JobState::Failure),
            other => Err(ParseJobStateError {
                value: other.to_string(),
            }),
        }
    }
}
