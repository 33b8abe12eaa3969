use thiserror::Error;

use common::{AttemptId, JobId, TaskId};

use crate::jobs::JobPhase;

/// Errors of the output commit protocol.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Job scaffolding could not be created. No task may run.
    #[error("setup of {job} failed")]
    SetupFailed {
        job: JobId,
        #[source]
        source: anyhow::Error,
    },

    /// Another attempt of the task committed first or holds its claim. The
    /// losing attempt's output has been discarded.
    #[error("{attempt} discarded: {winner} committed first")]
    CommitConflict { attempt: AttemptId, winner: AttemptId },

    /// Moving the winning attempt's output failed. The task's commit claim
    /// was released so a retry can commit.
    #[error("commit of {attempt} failed")]
    CommitFailed {
        attempt: AttemptId,
        #[source]
        source: anyhow::Error,
    },

    /// A failed commit could not release the task's claim. No attempt of the
    /// task can commit any more, so the job has to be aborted.
    #[error("{task} can no longer commit: the claim of {attempt} is stuck")]
    TaskUnrecoverable {
        task: TaskId,
        attempt: AttemptId,
        #[source]
        source: anyhow::Error,
    },

    /// Every task committed but finalizing the job did not.
    #[error("commit of {job} failed after all of its tasks committed")]
    JobCommitFailed {
        job: JobId,
        #[source]
        source: anyhow::Error,
    },

    /// Only ever logged; the job's verdict stands.
    #[error("cleanup of {job} failed")]
    CleanupFailed {
        job: JobId,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} is not allowed while {job} is {phase}")]
    InvalidPhase {
        job: JobId,
        operation: &'static str,
        phase: JobPhase,
    },

    #[error("{attempt} rejected: {reason}")]
    AttemptRejected { attempt: AttemptId, reason: String },

    #[error("{job} has {} uncommitted tasks and {in_flight} attempts in flight", .uncommitted.len())]
    TasksUnresolved {
        job: JobId,
        uncommitted: Vec<TaskId>,
        in_flight: usize,
    },

    #[error("output location `{0}` already exists")]
    OutputAlreadyExists(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CommitError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CommitError::CommitConflict { .. })
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, CommitError::TaskUnrecoverable { .. })
    }
}
