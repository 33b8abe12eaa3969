//! Output commit coordination for MapReduce-lite jobs.
//!
//! Every job gets a [`CommitCoordinator`] that guarantees at most one attempt
//! of each task publishes output, however many attempts were retried or
//! speculatively duplicated, and that drives the job's setup, commit, abort
//! and cleanup phases as its [`CommitterConfig`] asks. The
//! [`LocalJobRunner`] runs whole jobs on top of it.

pub mod committer;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod jobs;

pub use committer::{
    FileOutputCommitter, JobContext, NullOutputCommitter, NullOutputFormat, OutputCommitter,
    OutputFormat, TextOutputFormat,
};
pub use config::{CommitterConfig, JobConf};
pub use coordinator::{
    AbortReason, CleanupOutcome, CommitCoordinator, PhaseOutcome, TaskAbortReason,
};
pub use driver::{LocalJobRunner, RunningJob};
pub use error::CommitError;
pub use jobs::{AttemptOutcome, JobHistory, JobPhase, JobReport, JobSummary, TaskReport, TaskState};
