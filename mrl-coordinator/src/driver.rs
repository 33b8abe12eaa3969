//! In-process job driver.
//!
//! Runs every task attempt of a job on the local runtime, retries failed
//! attempts, optionally races speculative duplicates, and routes all output
//! through the job's [`CommitCoordinator`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::{AttemptId, JobId, ObjectStore, OutputLayout, TaskId, TaskKind, Workload};
use mrl_worker::{perform_map, perform_reduce, AttemptContext};

use crate::committer::{JobContext, OutputFormat, TextOutputFormat};
use crate::config::JobConf;
use crate::coordinator::{AbortReason, CleanupOutcome, CommitCoordinator, PhaseOutcome, TaskAbortReason};
use crate::error::CommitError;
use crate::jobs::{JobHistory, JobReport, TaskReport, TaskState};

pub const DEFAULT_CLUSTER: &str = "local";

/// Runs jobs against one object store and remembers their reports.
#[derive(Debug)]
pub struct LocalJobRunner {
    store: Arc<dyn ObjectStore>,
    cluster: String,
    next_seq: AtomicU32,
    history: Arc<Mutex<JobHistory>>,
    running: Arc<DashMap<JobId, CancellationToken>>,
}

/// A submitted job.
#[derive(Debug)]
pub struct RunningJob {
    job_id: JobId,
    token: CancellationToken,
    handle: JoinHandle<JobReport>,
}

impl RunningJob {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Stop every attempt and abort the job. Output already committed stays.
    pub fn kill(&self) {
        info!(job = %self.job_id, "kill requested");
        self.token.cancel();
    }

    pub async fn wait(self) -> Result<JobReport> {
        self.handle
            .await
            .map_err(|e| anyhow!("{} did not finish: {e}", self.job_id))
    }
}

impl LocalJobRunner {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_cluster(store, DEFAULT_CLUSTER)
    }

    pub fn with_cluster(store: Arc<dyn ObjectStore>, cluster: impl Into<String>) -> Self {
        Self {
            store,
            cluster: cluster.into(),
            next_seq: AtomicU32::new(1),
            history: Arc::new(Mutex::new(JobHistory::new())),
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn next_job_id(&self) -> JobId {
        JobId::new(self.cluster.as_str(), self.next_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Run a job writing text parts and wait for its report.
    pub async fn run_job(&self, conf: JobConf) -> Result<JobReport> {
        self.run_job_with(conf, Arc::new(TextOutputFormat)).await
    }

    pub async fn run_job_with(&self, conf: JobConf, format: Arc<dyn OutputFormat>) -> Result<JobReport> {
        self.submit(conf, format).await?.wait().await
    }

    /// Check the job's output and start it in the background.
    ///
    /// Fails without running anything if the workload is unknown or the
    /// output format rejects the output location.
    pub async fn submit(&self, conf: JobConf, format: Arc<dyn OutputFormat>) -> Result<RunningJob> {
        let workload = workload::try_named(&conf.workload)
            .ok_or_else(|| anyhow!("unknown workload `{}`", conf.workload))?;
        let job_id = self.next_job_id();
        let job = JobContext::new(
            job_id.clone(),
            OutputLayout::new(conf.output.as_str()),
            conf.num_maps(),
            conf.num_reduces,
        );

        format.check_output_specs(&self.store, &job).await?;
        let committer = format.committer(self.store.clone(), &job);
        let coordinator = Arc::new(CommitCoordinator::new(
            job,
            conf.committer,
            committer,
            self.store.clone(),
        ));

        let speculative = conf.speculative && conf.committer.needs_task_commit;
        if conf.speculative && !speculative {
            warn!(job = %job_id, "speculative execution needs task commit, running without it");
        }
        let run = Arc::new(JobRun {
            coordinator,
            store: self.store.clone(),
            workload,
            aux: conf.aux(),
            inputs: conf.inputs.clone(),
            max_attempts: conf.max_attempts.max(1),
            speculative,
            task_slots: conf.task_slots.max(1),
        });
        info!(
            job = %job_id,
            maps = conf.num_maps(),
            reduces = conf.num_reduces,
            workload = %conf.workload,
            output = %conf.output,
            "submitted job"
        );

        let token = CancellationToken::new();
        self.running.insert(job_id.clone(), token.clone());

        let history = self.history.clone();
        let running = self.running.clone();
        let job_token = token.clone();
        let handle = tokio::spawn(async move {
            let report = execute(run, job_token).await;
            running.remove(&report.job_id);
            info!(job = %report.job_id, phase = %report.phase, "job finished");
            history.lock().await.push(report.clone());
            report
        });

        Ok(RunningJob {
            job_id,
            token,
            handle,
        })
    }

    /// Kill a running job. Returns `false` if no such job is running.
    pub fn kill_job(&self, job_id: &JobId) -> bool {
        match self.running.get(job_id) {
            Some(token) => {
                info!(job = %job_id, "kill requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.running.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn job_report(&self, job_id: &JobId) -> Option<JobReport> {
        self.history.lock().await.get(job_id).cloned()
    }

    /// Task records of one kind of a finished job.
    pub async fn task_reports(&self, job_id: &JobId, kind: TaskKind) -> Option<Vec<TaskReport>> {
        let history = self.history.lock().await;
        history.get(job_id).map(|report| report.task_reports(kind).to_vec())
    }

    pub async fn purge(&self, job_id: &JobId) -> Option<JobReport> {
        self.history.lock().await.purge(job_id)
    }
}

/// Everything attempts of one job share.
#[derive(Debug)]
struct JobRun {
    coordinator: Arc<CommitCoordinator>,
    store: Arc<dyn ObjectStore>,
    workload: Workload,
    aux: Bytes,
    inputs: Vec<String>,
    max_attempts: u32,
    speculative: bool,
    task_slots: usize,
}

#[derive(Debug, Clone)]
enum TaskInput {
    Map(String),

    /// Committed attempts of every map task.
    Reduce(Arc<Vec<AttemptId>>),
}

#[derive(Debug)]
enum AttemptResult {
    Committed,
    Discarded,
    Failed(anyhow::Error),

    /// No attempt of the task can commit any more.
    Unrecoverable(anyhow::Error),
    Killed,
}

async fn execute(run: Arc<JobRun>, token: CancellationToken) -> JobReport {
    let coordinator = run.coordinator.clone();
    let job_id = coordinator.job().job_id.clone();
    let mut report = JobReport::new(job_id.clone());

    match coordinator.setup_job().await {
        Ok(PhaseOutcome::Ran) => report.setup_tasks.push(TaskReport::job_level(
            job_id.task(TaskKind::JobSetup, 0),
            TaskState::Succeeded,
        )),
        Ok(PhaseOutcome::Skipped) => {}
        Err(e) => {
            report.setup_tasks.push(TaskReport::job_level(
                job_id.task(TaskKind::JobSetup, 0),
                TaskState::Failed,
            ));
            report.failure = Some(format!("{:#}", anyhow::Error::from(e)));
            let cleanup = coordinator.cleanup_job().await;
            return finish(&coordinator, report, cleanup);
        }
    }

    let inputs = run.inputs.iter().cloned().map(TaskInput::Map).collect();
    let (map_tasks, verdict) = run_phase(&run, TaskKind::Map, inputs, &token).await;
    report.map_tasks = map_tasks;
    if let Some(reason) = verdict {
        return abort(&coordinator, report, reason).await;
    }

    let num_reduces = coordinator.job().num_reduces;
    if num_reduces > 0 {
        let map_attempts = Arc::new(coordinator.committed_attempts(TaskKind::Map).await);
        debug!(job = %job_id, maps = map_attempts.len(), "starting reduce phase");
        let inputs = (0..num_reduces)
            .map(|_| TaskInput::Reduce(map_attempts.clone()))
            .collect();
        let (reduce_tasks, verdict) = run_phase(&run, TaskKind::Reduce, inputs, &token).await;
        report.reduce_tasks = reduce_tasks;
        if let Some(reason) = verdict {
            return abort(&coordinator, report, reason).await;
        }
    }

    match coordinator.commit_job().await {
        Ok(summary) => report.summary = Some(summary),
        Err(e) => {
            report.failure = Some(format!("{:#}", anyhow::Error::from(e)));
            if !coordinator.phase().is_terminal() {
                return abort(&coordinator, report, AbortReason::Failed).await;
            }
        }
    }
    let cleanup = coordinator.cleanup_job().await;
    finish(&coordinator, report, cleanup)
}

async fn abort(coordinator: &CommitCoordinator, mut report: JobReport, reason: AbortReason) -> JobReport {
    let message = match reason {
        AbortReason::Killed => "killed on request".to_string(),
        AbortReason::Failed => report
            .failure
            .clone()
            .unwrap_or_else(|| "a task exhausted its attempts".to_string()),
    };
    report.failure.get_or_insert_with(|| message.clone());
    let cleanup = coordinator.abort_job(reason, &message).await;
    finish(coordinator, report, cleanup)
}

fn finish(
    coordinator: &CommitCoordinator,
    mut report: JobReport,
    cleanup: Result<CleanupOutcome, CommitError>,
) -> JobReport {
    let task = coordinator.job().job_id.task(TaskKind::JobCleanup, 0);
    match cleanup {
        Ok(CleanupOutcome::Ran) => report
            .cleanup_tasks
            .push(TaskReport::job_level(task, TaskState::Succeeded)),
        Ok(CleanupOutcome::Failed(_)) => report
            .cleanup_tasks
            .push(TaskReport::job_level(task, TaskState::Failed)),
        Ok(CleanupOutcome::Skipped | CleanupOutcome::AlreadyDone) => {}
        Err(e) => warn!(job = %report.job_id, error = %e, "could not clean up job"),
    }
    report.phase = coordinator.phase();
    report
}

/// Run every task of one kind. Stops the remaining tasks once one of them
/// fails for good.
async fn run_phase(
    run: &Arc<JobRun>,
    kind: TaskKind,
    inputs: Vec<TaskInput>,
    token: &CancellationToken,
) -> (Vec<TaskReport>, Option<AbortReason>) {
    let stop = token.child_token();
    let slots = Arc::new(Semaphore::new(run.task_slots));
    let mut tasks = JoinSet::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let task = run.coordinator.job().job_id.task(kind, index as u32);
        let run = run.clone();
        let slots = slots.clone();
        let stop = stop.clone();
        tasks.spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return killed(task, 0);
            };
            run_task(run, task, input, stop).await
        });
    }

    let mut reports = vec![];
    let mut failed = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => {
                if report.state == TaskState::Failed && !failed {
                    failed = true;
                    stop.cancel();
                }
                reports.push(report);
            }
            Err(e) => {
                error!(job = %run.coordinator.job().job_id, %kind, error = %e, "task runner died");
                failed = true;
                stop.cancel();
            }
        }
    }
    reports.sort_by_key(|report| report.task.index());

    let verdict = if token.is_cancelled() {
        Some(AbortReason::Killed)
    } else if failed {
        Some(AbortReason::Failed)
    } else {
        None
    };
    (reports, verdict)
}

fn killed(task: TaskId, attempts: u32) -> TaskReport {
    TaskReport {
        task,
        state: TaskState::Killed,
        attempts,
        committed_attempt: None,
    }
}

async fn run_task(run: Arc<JobRun>, task: TaskId, input: TaskInput, stop: CancellationToken) -> TaskReport {
    let coordinator = &run.coordinator;
    let mut launched = 0;
    let mut failures = 0;

    loop {
        if stop.is_cancelled() || !coordinator.phase().accepts_attempts() {
            return killed(task, launched);
        }

        let wave = if run.speculative { 2 } else { 1 };
        let wave = wave.min(run.max_attempts - failures);
        let mut attempts = JoinSet::new();
        for _ in 0..wave {
            let attempt = task.attempt(launched);
            launched += 1;
            attempts.spawn(run_attempt(run.clone(), attempt, input.clone(), stop.clone()));
        }

        let mut was_killed = false;
        let mut discarded = 0;
        let mut unrecoverable = false;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(AttemptResult::Committed) => {}
                Ok(AttemptResult::Discarded) => discarded += 1,
                Ok(AttemptResult::Killed) => was_killed = true,
                Ok(AttemptResult::Failed(e)) => {
                    failures += 1;
                    warn!(%task, failures, error = ?e, "attempt failed");
                }
                Ok(AttemptResult::Unrecoverable(e)) => {
                    unrecoverable = true;
                    error!(%task, error = ?e, "task can no longer commit");
                }
                Err(e) => {
                    failures += 1;
                    error!(%task, failures, error = %e, "attempt died");
                }
            }
        }

        if let Some(winner) = coordinator.committed_attempt(&task).await {
            return TaskReport {
                task,
                state: TaskState::Succeeded,
                attempts: launched,
                committed_attempt: Some(winner),
            };
        }
        if was_killed {
            return killed(task, launched);
        }
        // Lost to a claim this job does not own; only a retry can tell
        // whether it gets released.
        failures += discarded;
        if unrecoverable || failures >= run.max_attempts {
            error!(%task, failures, "task failed, giving up");
            return TaskReport {
                task,
                state: TaskState::Failed,
                attempts: launched,
                committed_attempt: None,
            };
        }
        info!(%task, failures, "retrying task");
    }
}

async fn run_attempt(
    run: Arc<JobRun>,
    attempt: AttemptId,
    input: TaskInput,
    stop: CancellationToken,
) -> AttemptResult {
    let coordinator = &run.coordinator;
    if let Err(e) = coordinator.register_attempt(&attempt).await {
        return match e {
            CommitError::InvalidPhase { .. } => AttemptResult::Killed,
            other => AttemptResult::Failed(other.into()),
        };
    }

    let ctx = AttemptContext {
        attempt: attempt.clone(),
        store: run.store.clone(),
        layout: coordinator.job().layout.clone(),
        work_dir: coordinator.work_dir(&attempt),
        num_reduces: coordinator.job().num_reduces,
        workload: run.workload,
        aux: run.aux.clone(),
    };

    let executed = tokio::select! {
        _ = stop.cancelled() => None,
        result = perform(&ctx, &input) => Some(result),
    };
    let records = match executed {
        None => {
            coordinator.abort_task(&attempt, TaskAbortReason::Killed).await;
            return AttemptResult::Killed;
        }
        Some(Err(e)) => {
            coordinator.abort_task(&attempt, TaskAbortReason::Failed).await;
            return AttemptResult::Failed(e);
        }
        Some(Ok(records)) => records,
    };
    debug!(%attempt, records, "attempt finished");

    match coordinator.commit_task(&attempt).await {
        Ok(()) => AttemptResult::Committed,
        Err(e) if e.is_conflict() => AttemptResult::Discarded,
        Err(e) if e.is_unrecoverable() => {
            coordinator.abort_task(&attempt, TaskAbortReason::Failed).await;
            AttemptResult::Unrecoverable(e.into())
        }
        Err(CommitError::InvalidPhase { .. }) => {
            coordinator.abort_task(&attempt, TaskAbortReason::Killed).await;
            AttemptResult::Killed
        }
        Err(e) => {
            coordinator.abort_task(&attempt, TaskAbortReason::Failed).await;
            AttemptResult::Failed(e.into())
        }
    }
}

async fn perform(ctx: &AttemptContext, input: &TaskInput) -> Result<usize> {
    match input {
        TaskInput::Map(key) => perform_map(ctx, key).await,
        TaskInput::Reduce(map_attempts) => perform_reduce(ctx, map_attempts).await,
    }
}
