//! Identifiers for jobs, tasks and task attempts.
//!
//! Ids render in the canonical forms
//!
//! ```text
//! job_<cluster>_<seq>
//! task_<cluster>_<seq>_<kind>_<index>
//! attempt_<cluster>_<seq>_<kind>_<index>_<attempt>
//! ```
//!
//! and parse back from them, so an id can be stored in an object (the commit
//! claim does this) and recovered by another process.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("`{0}` is not a {1} id")]
    Malformed(String, &'static str),

    #[error("unknown task kind `{0}`")]
    UnknownKind(String),
}

/// Identifies one job for its whole lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    cluster: String,
    seq: u32,
}

impl JobId {
    /// Underscores separate id fields, so they are not allowed in the
    /// cluster identifier and are replaced with `-`.
    pub fn new(cluster: impl Into<String>, seq: u32) -> Self {
        Self {
            cluster: cluster.into().replace('_', "-"),
            seq,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// The id of task `index` of the given kind in this job.
    pub fn task(&self, kind: TaskKind, index: u32) -> TaskId {
        TaskId::new(self.clone(), kind, index)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}_{:04}", self.cluster, self.seq)
    }
}

impl FromStr for JobId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('_').collect();
        match fields.as_slice() {
            ["job", cluster, seq] => parse_job(cluster, seq, s, "job"),
            _ => Err(IdParseError::Malformed(s.to_string(), "job")),
        }
    }
}

/// The kind of a task.
///
/// Only map and reduce tasks produce output that goes through task commit.
/// Setup and cleanup kinds exist so the driver can report the job-level
/// phases as task records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Map,
    Reduce,
    JobSetup,
    JobCleanup,
}

impl TaskKind {
    /// Single character used in ids and part names.
    pub fn code(&self) -> char {
        match self {
            TaskKind::Map => 'm',
            TaskKind::Reduce => 'r',
            TaskKind::JobSetup => 's',
            TaskKind::JobCleanup => 'c',
        }
    }

    pub fn from_code(code: &str) -> Result<Self, IdParseError> {
        match code {
            "m" => Ok(TaskKind::Map),
            "r" => Ok(TaskKind::Reduce),
            "s" => Ok(TaskKind::JobSetup),
            "c" => Ok(TaskKind::JobCleanup),
            other => Err(IdParseError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Map => "map",
            TaskKind::Reduce => "reduce",
            TaskKind::JobSetup => "job-setup",
            TaskKind::JobCleanup => "job-cleanup",
        };
        f.write_str(name)
    }
}

/// A task of a job: unique within the job by (kind, index).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    job: JobId,
    kind: TaskKind,
    index: u32,
}

impl TaskId {
    pub fn new(job: JobId, kind: TaskKind, index: u32) -> Self {
        Self { job, kind, index }
    }

    pub fn job(&self) -> &JobId {
        &self.job
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn attempt(&self, number: u32) -> AttemptId {
        AttemptId::new(self.clone(), number)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task_{}_{:04}_{}_{:06}",
            self.job.cluster,
            self.job.seq,
            self.kind.code(),
            self.index
        )
    }
}

impl FromStr for TaskId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('_').collect();
        match fields.as_slice() {
            ["task", cluster, seq, kind, index] => parse_task(cluster, seq, kind, index, s, "task"),
            _ => Err(IdParseError::Malformed(s.to_string(), "task")),
        }
    }
}

/// One execution of a task. Retries and speculative duplicates get fresh
/// attempt numbers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId {
    task: TaskId,
    attempt: u32,
}

impl AttemptId {
    pub fn new(task: TaskId, attempt: u32) -> Self {
        Self { task, attempt }
    }

    pub fn task(&self) -> &TaskId {
        &self.task
    }

    pub fn job(&self) -> &JobId {
        &self.task.job
    }

    pub fn number(&self) -> u32 {
        self.attempt
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task = &self.task;
        write!(
            f,
            "attempt_{}_{:04}_{}_{:06}_{}",
            task.job.cluster,
            task.job.seq,
            task.kind.code(),
            task.index,
            self.attempt
        )
    }
}

impl FromStr for AttemptId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('_').collect();
        match fields.as_slice() {
            ["attempt", cluster, seq, kind, index, attempt] => {
                let task = parse_task(cluster, seq, kind, index, s, "attempt")?;
                let attempt = attempt
                    .parse()
                    .map_err(|_| IdParseError::Malformed(s.to_string(), "attempt"))?;
                Ok(AttemptId::new(task, attempt))
            }
            _ => Err(IdParseError::Malformed(s.to_string(), "attempt")),
        }
    }
}

fn parse_job(cluster: &str, seq: &str, whole: &str, what: &'static str) -> Result<JobId, IdParseError> {
    let seq = seq
        .parse()
        .map_err(|_| IdParseError::Malformed(whole.to_string(), what))?;
    Ok(JobId::new(cluster.to_string(), seq))
}

fn parse_task(
    cluster: &str,
    seq: &str,
    kind: &str,
    index: &str,
    whole: &str,
    what: &'static str,
) -> Result<TaskId, IdParseError> {
    let job = parse_job(cluster, seq, whole, what)?;
    let kind = TaskKind::from_code(kind)?;
    let index = index
        .parse()
        .map_err(|_| IdParseError::Malformed(whole.to_string(), what))?;
    Ok(TaskId::new(job, kind, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_in_canonical_form() {
        let job = JobId::new("local", 7);
        let attempt = job.task(TaskKind::Reduce, 3).attempt(1);

        assert_eq!(job.to_string(), "job_local_0007");
        assert_eq!(attempt.task().to_string(), "task_local_0007_r_000003");
        assert_eq!(attempt.to_string(), "attempt_local_0007_r_000003_1");
    }

    #[test]
    fn attempt_id_parses_back() {
        let attempt = JobId::new("20261016", 12).task(TaskKind::Map, 42).attempt(2);
        let parsed: AttemptId = attempt.to_string().parse().unwrap();

        assert_eq!(parsed, attempt);
        assert_eq!(parsed.task().kind(), TaskKind::Map);
        assert_eq!(parsed.job().seq(), 12);
    }

    #[test]
    fn cluster_underscores_are_replaced() {
        let job = JobId::new("my_cluster", 1);
        assert_eq!(job.cluster(), "my-cluster");
        assert_eq!("job_my-cluster_0001".parse::<JobId>().unwrap(), job);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!("job_local".parse::<JobId>().is_err());
        assert!("task_local_0001_x_000001".parse::<TaskId>().is_err());
        assert_eq!(
            "attempt_local_0001_m_000001_z".parse::<AttemptId>(),
            Err(IdParseError::Malformed(
                "attempt_local_0001_m_000001_z".to_string(),
                "attempt"
            ))
        );
    }
}
