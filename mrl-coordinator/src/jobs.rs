use std::collections::VecDeque;
use std::fmt;

use common::{AttemptId, JobId, TaskId, TaskKind};

/// Phase of a job, owned by its commit coordinator.
///
/// Advances in declaration order, except that `Failed` and `Aborted` can be
/// entered from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPhase {
    /// Job submitted, nothing run yet.
    Created,

    /// Job setup in progress.
    SetupRunning,

    SetupDone,

    /// Task attempts are running and committing.
    TasksRunning,

    /// Every required task committed, job commit in progress.
    Committing,

    Succeeded,

    /// A task exhausted its attempts, or setup / job commit failed.
    Failed,

    /// Killed on request.
    Aborted,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed | JobPhase::Aborted)
    }

    /// New task attempts are only accepted in these phases.
    pub fn accepts_attempts(&self) -> bool {
        matches!(self, JobPhase::Created | JobPhase::TasksRunning)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Created => "CREATED",
            JobPhase::SetupRunning => "SETUP_RUNNING",
            JobPhase::SetupDone => "SETUP_DONE",
            JobPhase::TasksRunning => "TASKS_RUNNING",
            JobPhase::Committing => "COMMITTING",
            JobPhase::Succeeded => "SUCCEEDED",
            JobPhase::Failed => "FAILED",
            JobPhase::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// What became of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptOutcome {
    Running,

    /// Holds the task's commit claim, output being moved.
    NeedsCommit,

    Committed,

    /// Lost a commit race, was killed, or was dropped with its job.
    Discarded,

    Failed,
}

impl AttemptOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Committed | AttemptOutcome::Discarded | AttemptOutcome::Failed
        )
    }
}

/// Final state of a task as reported to the job's submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Succeeded,
    Failed,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: TaskId,
    pub state: TaskState,

    /// Number of attempts launched, including speculative duplicates.
    pub attempts: u32,

    pub committed_attempt: Option<AttemptId>,
}

impl TaskReport {
    /// Record for a job-level phase (setup or cleanup) that ran.
    pub fn job_level(task: TaskId, state: TaskState) -> Self {
        Self {
            task,
            state,
            attempts: 1,
            committed_attempt: None,
        }
    }
}

/// Counts handed back by a successful job commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub committed_maps: u32,
    pub committed_reduces: u32,
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} committed map tasks, {} committed reduce tasks",
            self.committed_maps, self.committed_reduces
        )
    }
}

/// Outcome of a job, with one task record per task that ran.
///
/// Setup and cleanup records only exist when those phases ran, which is how
/// a caller checks that disabled phases stayed disabled.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub phase: JobPhase,
    pub setup_tasks: Vec<TaskReport>,
    pub map_tasks: Vec<TaskReport>,
    pub reduce_tasks: Vec<TaskReport>,
    pub cleanup_tasks: Vec<TaskReport>,
    pub summary: Option<JobSummary>,

    /// Why the job did not succeed.
    pub failure: Option<String>,
}

impl JobReport {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            phase: JobPhase::Created,
            setup_tasks: vec![],
            map_tasks: vec![],
            reduce_tasks: vec![],
            cleanup_tasks: vec![],
            summary: None,
            failure: None,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.phase == JobPhase::Succeeded
    }

    pub fn task_reports(&self, kind: TaskKind) -> &[TaskReport] {
        match kind {
            TaskKind::Map => &self.map_tasks,
            TaskKind::Reduce => &self.reduce_tasks,
            TaskKind::JobSetup => &self.setup_tasks,
            TaskKind::JobCleanup => &self.cleanup_tasks,
        }
    }
}

/// Reports of finished jobs, oldest first.
///
/// Jobs are kept in order to maintain history until purged.
#[derive(Debug, Default)]
pub struct JobHistory {
    jobs: VecDeque<JobReport>,
}

impl JobHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn push(&mut self, report: JobReport) {
        self.jobs.push_back(report);
    }

    pub fn get(&self, job_id: &JobId) -> Option<&JobReport> {
        self.jobs.iter().find(|r| &r.job_id == job_id)
    }

    /// Forget a reported job.
    pub fn purge(&mut self, job_id: &JobId) -> Option<JobReport> {
        let index = self.jobs.iter().position(|r| &r.job_id == job_id)?;
        self.jobs.remove(index)
    }

    pub fn all(&self) -> &VecDeque<JobReport> {
        &self.jobs
    }
}
