//! The per-job commit coordinator.
//!
//! Decides which attempt of every task becomes visible and drives the job
//! through its phases. All storage work is delegated to an
//! [`OutputCommitter`]; the coordinator only decides when each hook runs.
//!
//! Job state sits behind one `RwLock`. Task-level operations take it shared,
//! so unrelated tasks commit in parallel, and job-level operations take it
//! exclusively. Commits of one task are additionally serialized by a
//! per-task slot, always locked after the job state.

use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use common::{AttemptId, ObjectStore, TaskId, TaskKind};

use crate::committer::{JobContext, OutputCommitter};
use crate::config::CommitterConfig;
use crate::error::CommitError;
use crate::jobs::{AttemptOutcome, JobPhase, JobSummary};

/// Whether a job-level phase did any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAbortReason {
    /// The attempt itself failed.
    Failed,

    /// The attempt was stopped from outside.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Failed,
    Killed,
}

impl AbortReason {
    fn phase(self) -> JobPhase {
        match self {
            AbortReason::Failed => JobPhase::Failed,
            AbortReason::Killed => JobPhase::Aborted,
        }
    }
}

#[derive(Debug)]
pub enum CleanupOutcome {
    Ran,
    Skipped,
    AlreadyDone,

    /// Cleanup was attempted and failed. Already logged.
    Failed(CommitError),
}

impl CleanupOutcome {
    /// Whether the cleanup hook was invoked by this call.
    pub fn ran(&self) -> bool {
        matches!(self, CleanupOutcome::Ran | CleanupOutcome::Failed(_))
    }
}

#[derive(Debug)]
struct JobState {
    phase: JobPhase,
    cleanup_done: bool,
}

#[derive(Debug, Default)]
struct TaskSlot {
    /// Only ever set by an attempt whose output this coordinator moved.
    committed: Option<AttemptId>,

    /// Attempt whose failed commit left the claim behind.
    stuck: Option<AttemptId>,
}

#[derive(Debug)]
pub struct CommitCoordinator {
    job: JobContext,
    config: CommitterConfig,
    committer: Arc<dyn OutputCommitter>,
    store: Arc<dyn ObjectStore>,
    state: RwLock<JobState>,
    phase_tx: watch::Sender<JobPhase>,
    slots: DashMap<TaskId, Arc<Mutex<TaskSlot>>>,
    attempts: DashMap<AttemptId, AttemptOutcome>,
}

impl CommitCoordinator {
    pub fn new(
        job: JobContext,
        config: CommitterConfig,
        committer: Arc<dyn OutputCommitter>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(JobPhase::Created);
        Self {
            job,
            config,
            committer,
            store,
            state: RwLock::new(JobState {
                phase: JobPhase::Created,
                cleanup_done: false,
            }),
            phase_tx,
            slots: DashMap::new(),
            attempts: DashMap::new(),
        }
    }

    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn config(&self) -> CommitterConfig {
        self.config
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase_tx.borrow()
    }

    /// Receives every phase transition of the job.
    pub fn subscribe(&self) -> watch::Receiver<JobPhase> {
        self.phase_tx.subscribe()
    }

    /// Where an attempt must write its part. The final output location when
    /// task commit is disabled.
    pub fn work_dir(&self, attempt: &AttemptId) -> String {
        if self.config.needs_task_commit {
            self.committer.work_dir(attempt)
        } else {
            self.job.layout.output_dir().to_string()
        }
    }

    pub fn attempt_outcome(&self, attempt: &AttemptId) -> Option<AttemptOutcome> {
        self.attempts.get(attempt).map(|outcome| *outcome.value())
    }

    pub async fn committed_attempt(&self, task: &TaskId) -> Option<AttemptId> {
        let slot = self.slots.get(task).map(|slot| slot.value().clone())?;
        let committed = slot.lock().await.committed.clone();
        committed
    }

    /// Committed attempts of every task of `kind` that has one, by index.
    pub async fn committed_attempts(&self, kind: TaskKind) -> Vec<AttemptId> {
        let mut committed = vec![];
        for task in self.tasks_of(kind) {
            if let Some(attempt) = self.committed_attempt(&task).await {
                committed.push(attempt);
            }
        }
        committed
    }

    pub async fn setup_job(&self) -> Result<PhaseOutcome, CommitError> {
        let mut state = self.state.write().await;
        if state.phase != JobPhase::Created {
            return Err(self.invalid_phase("setup_job", state.phase));
        }

        if !self.config.needs_job_setup {
            debug!(job = %self.job.job_id, "job setup disabled");
            self.transition(&mut state, JobPhase::TasksRunning);
            return Ok(PhaseOutcome::Skipped);
        }

        self.transition(&mut state, JobPhase::SetupRunning);
        if let Err(source) = self.committer.setup_job(&self.job).await {
            error!(job = %self.job.job_id, error = ?source, "job setup failed");
            self.transition(&mut state, JobPhase::Failed);
            return Err(CommitError::SetupFailed {
                job: self.job.job_id.clone(),
                source,
            });
        }
        self.transition(&mut state, JobPhase::SetupDone);
        self.transition(&mut state, JobPhase::TasksRunning);
        Ok(PhaseOutcome::Ran)
    }

    /// Admit a new attempt. Rejected once the job stopped accepting attempts,
    /// for tasks the job does not have, and for tasks already committed.
    pub async fn register_attempt(&self, attempt: &AttemptId) -> Result<(), CommitError> {
        let state = self.state.read().await;
        if !state.phase.accepts_attempts() {
            return Err(self.invalid_phase("register_attempt", state.phase));
        }

        let task = attempt.task();
        if attempt.job() != &self.job.job_id {
            return Err(reject(attempt, format!("belongs to {}", attempt.job())));
        }
        let count = match task.kind() {
            TaskKind::Map => self.job.num_maps,
            TaskKind::Reduce => self.job.num_reduces,
            other => return Err(reject(attempt, format!("{other} tasks have no output"))),
        };
        if task.index() >= count {
            return Err(reject(
                attempt,
                format!("job has {count} {} tasks", task.kind()),
            ));
        }
        if let Some(winner) = self.committed_attempt(task).await {
            return Err(reject(attempt, format!("{winner} already committed")));
        }

        match self.attempts.entry(attempt.clone()) {
            Entry::Occupied(_) => Err(reject(attempt, "already registered".to_string())),
            Entry::Vacant(entry) => {
                entry.insert(AttemptOutcome::Running);
                debug!(%attempt, "registered attempt");
                Ok(())
            }
        }
    }

    /// Whether committing the attempt would move anything. Never changes
    /// state, so asking twice gives the same answer.
    pub async fn needs_task_commit(&self, attempt: &AttemptId) -> Result<bool, CommitError> {
        if !self.config.needs_task_commit {
            return Ok(false);
        }
        Ok(self.committer.needs_task_commit(attempt).await?)
    }

    /// Commit a finished attempt. The first attempt of a task to claim its
    /// commit slot wins; every later one gets [`CommitError::CommitConflict`]
    /// and has its staged output discarded.
    ///
    /// The claim is recorded in the store, so attempts coordinated by other
    /// processes cannot both win. Attempts with nothing to move still claim:
    /// the claim is what records which attempt's output (spills included)
    /// counts. A failed commit whose claim cannot be released leaves the task
    /// unable to commit, reported as [`CommitError::TaskUnrecoverable`].
    pub async fn commit_task(&self, attempt: &AttemptId) -> Result<(), CommitError> {
        let state = self.state.read().await;
        if !state.phase.accepts_attempts() {
            return Err(self.invalid_phase("commit_task", state.phase));
        }

        let slot = self.slot(attempt.task());
        let mut slot = slot.lock().await;
        match self.attempt_outcome(attempt) {
            Some(AttemptOutcome::Running) => {}
            Some(outcome) => {
                return Err(reject(attempt, format!("attempt is already {outcome:?}")));
            }
            None => return Err(reject(attempt, "attempt was never registered".to_string())),
        }

        if let Some(winner) = slot.committed.clone() {
            return Err(self.discard_loser(attempt, winner).await);
        }
        if let Some(owner) = slot.stuck.clone() {
            self.attempts.insert(attempt.clone(), AttemptOutcome::Failed);
            return Err(CommitError::TaskUnrecoverable {
                task: attempt.task().clone(),
                attempt: owner.clone(),
                source: anyhow!("claim of {owner} was never released"),
            });
        }

        let claim = self.job.layout.claim_key(attempt.task());
        let claimed = self
            .store
            .put_if_absent(&claim, Bytes::from(attempt.to_string()))
            .await
            .map_err(|source| CommitError::CommitFailed {
                attempt: attempt.clone(),
                source,
            })?;
        if !claimed {
            let owner = self
                .read_claim(&claim)
                .await
                .map_err(|source| CommitError::CommitFailed {
                    attempt: attempt.clone(),
                    source,
                })?;
            // Held by an attempt this coordinator never saw commit. It may
            // still fail and release the claim, so the task stays open.
            if owner != *attempt {
                return Err(self.discard_loser(attempt, owner).await);
            }
        }

        self.attempts
            .insert(attempt.clone(), AttemptOutcome::NeedsCommit);
        debug!(%attempt, %claim, "claimed commit slot");

        match self.move_output(attempt).await {
            Ok(()) => {
                slot.committed = Some(attempt.clone());
                self.attempts
                    .insert(attempt.clone(), AttemptOutcome::Committed);
                info!(%attempt, "committed attempt");
                Ok(())
            }
            Err(source) => {
                error!(%attempt, error = ?source, "task commit failed, releasing commit slot");
                self.attempts.insert(attempt.clone(), AttemptOutcome::Failed);
                if let Err(e) = self.store.delete(&claim).await {
                    error!(%attempt, %claim, error = ?e, "could not release commit slot");
                    slot.stuck = Some(attempt.clone());
                    return Err(CommitError::TaskUnrecoverable {
                        task: attempt.task().clone(),
                        attempt: attempt.clone(),
                        source: source.context(format!("releasing `{claim}` failed: {e:#}")),
                    });
                }
                Err(CommitError::CommitFailed {
                    attempt: attempt.clone(),
                    source,
                })
            }
        }
    }

    /// Discard what an attempt staged. Never fails; problems are logged.
    /// Committed attempts are left alone.
    pub async fn abort_task(&self, attempt: &AttemptId, reason: TaskAbortReason) {
        let _state = self.state.read().await;
        let slot = self.slot(attempt.task());
        let slot = slot.lock().await;

        let outcome = self.attempt_outcome(attempt);
        if outcome == Some(AttemptOutcome::Committed) {
            warn!(%attempt, "not aborting a committed attempt");
            return;
        }

        debug!(%attempt, ?reason, "aborting attempt");
        self.discard_staging(attempt).await;
        if !self.config.needs_task_commit && slot.committed.is_none() {
            self.discard_direct_output(attempt.task()).await;
        }

        if outcome.is_some_and(|o| !o.is_resolved()) {
            let outcome = match reason {
                TaskAbortReason::Failed => AttemptOutcome::Failed,
                TaskAbortReason::Killed => AttemptOutcome::Discarded,
            };
            self.attempts.insert(attempt.clone(), outcome);
        }
    }

    /// Finish a job whose every task committed. Fails without changing
    /// anything while a task is uncommitted or an attempt is in flight.
    pub async fn commit_job(&self) -> Result<JobSummary, CommitError> {
        let mut state = self.state.write().await;
        if state.phase != JobPhase::TasksRunning {
            return Err(self.invalid_phase("commit_job", state.phase));
        }

        let in_flight = self
            .attempts
            .iter()
            .filter(|outcome| !outcome.value().is_resolved())
            .count();
        let mut uncommitted = vec![];
        let mut summary = JobSummary::default();
        for task in self.required_tasks() {
            match (self.committed_attempt(&task).await, task.kind()) {
                (None, _) => uncommitted.push(task),
                (Some(_), TaskKind::Map) => summary.committed_maps += 1,
                (Some(_), _) => summary.committed_reduces += 1,
            }
        }
        if !uncommitted.is_empty() || in_flight > 0 {
            return Err(CommitError::TasksUnresolved {
                job: self.job.job_id.clone(),
                uncommitted,
                in_flight,
            });
        }

        self.transition(&mut state, JobPhase::Committing);
        if self.config.needs_job_cleanup {
            if let Err(source) = self.committer.commit_job(&self.job).await {
                error!(job = %self.job.job_id, error = ?source, "job commit failed");
                self.transition(&mut state, JobPhase::Failed);
                return Err(CommitError::JobCommitFailed {
                    job: self.job.job_id.clone(),
                    source,
                });
            }
        }
        self.transition(&mut state, JobPhase::Succeeded);
        info!(job = %self.job.job_id, %summary, "job committed");
        Ok(summary)
    }

    /// End a running job. Staged output of every attempt that is not
    /// committed is dropped; committed output stays. Runs job cleanup.
    pub async fn abort_job(
        &self,
        reason: AbortReason,
        message: &str,
    ) -> Result<CleanupOutcome, CommitError> {
        let mut state = self.state.write().await;
        if state.phase.is_terminal() {
            return Err(self.invalid_phase("abort_job", state.phase));
        }
        warn!(job = %self.job.job_id, ?reason, message, "aborting job");

        let pending: Vec<AttemptId> = self
            .attempts
            .iter()
            .filter(|outcome| !outcome.value().is_resolved())
            .map(|outcome| outcome.key().clone())
            .collect();
        for attempt in pending {
            self.discard_staging(&attempt).await;
            self.attempts.insert(attempt, AttemptOutcome::Discarded);
        }
        if !self.config.needs_task_commit {
            for task in self.required_tasks() {
                if self.committed_attempt(&task).await.is_none() {
                    self.discard_direct_output(&task).await;
                }
            }
        }

        self.transition(&mut state, reason.phase());
        if self.config.needs_job_cleanup {
            if let Err(e) = self.committer.abort_job(&self.job, state.phase).await {
                warn!(job = %self.job.job_id, error = ?e, "could not discard job staging");
            }
        }
        Ok(self.run_cleanup(&mut state).await)
    }

    /// Run job cleanup once the job reached a verdict. Cleanup runs at most
    /// once and its failure never changes the verdict.
    pub async fn cleanup_job(&self) -> Result<CleanupOutcome, CommitError> {
        let mut state = self.state.write().await;
        if !state.phase.is_terminal() {
            return Err(self.invalid_phase("cleanup_job", state.phase));
        }
        Ok(self.run_cleanup(&mut state).await)
    }

    async fn run_cleanup(&self, state: &mut JobState) -> CleanupOutcome {
        if state.cleanup_done {
            return CleanupOutcome::AlreadyDone;
        }
        state.cleanup_done = true;

        if !self.config.needs_job_cleanup {
            debug!(job = %self.job.job_id, "job cleanup disabled");
            return CleanupOutcome::Skipped;
        }
        match self.committer.cleanup_job(&self.job).await {
            Ok(()) => {
                info!(job = %self.job.job_id, phase = %state.phase, "job cleaned up");
                CleanupOutcome::Ran
            }
            Err(source) => {
                let err = CommitError::CleanupFailed {
                    job: self.job.job_id.clone(),
                    source,
                };
                error!(job = %self.job.job_id, error = ?err, "job cleanup failed");
                CleanupOutcome::Failed(err)
            }
        }
    }

    async fn move_output(&self, attempt: &AttemptId) -> anyhow::Result<()> {
        if self.config.needs_task_commit && self.committer.needs_task_commit(attempt).await? {
            self.committer.commit_task(attempt).await?;
        }
        Ok(())
    }

    async fn read_claim(&self, claim: &str) -> anyhow::Result<AttemptId> {
        let owner = self.store.get(claim).await?;
        let owner = std::str::from_utf8(&owner)?;
        owner
            .trim()
            .parse()
            .map_err(|e| anyhow!("corrupt commit claim `{claim}`: {e}"))
    }

    async fn discard_loser(&self, attempt: &AttemptId, winner: AttemptId) -> CommitError {
        info!(%attempt, %winner, "attempt discarded, another attempt committed first");
        self.discard_staging(attempt).await;
        self.attempts
            .insert(attempt.clone(), AttemptOutcome::Discarded);
        CommitError::CommitConflict {
            attempt: attempt.clone(),
            winner,
        }
    }

    async fn discard_staging(&self, attempt: &AttemptId) {
        if let Err(e) = self.committer.abort_task(attempt).await {
            warn!(%attempt, error = ?e, "could not discard staged output");
        }
    }

    /// Attempts write final parts directly when task commit is disabled, so
    /// an uncommitted task's part has to go.
    async fn discard_direct_output(&self, task: &TaskId) {
        let part = self.job.layout.final_part_key(task);
        if let Err(e) = self.store.delete(&part).await {
            warn!(%task, %part, error = ?e, "could not remove uncommitted part");
        }
    }

    fn slot(&self, task: &TaskId) -> Arc<Mutex<TaskSlot>> {
        self.slots.entry(task.clone()).or_default().value().clone()
    }

    fn tasks_of(&self, kind: TaskKind) -> impl Iterator<Item = TaskId> + '_ {
        let count = match kind {
            TaskKind::Map => self.job.num_maps,
            TaskKind::Reduce => self.job.num_reduces,
            _ => 0,
        };
        (0..count).map(move |index| self.job.job_id.task(kind, index))
    }

    fn required_tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks_of(TaskKind::Map)
            .chain(self.tasks_of(TaskKind::Reduce))
    }

    fn transition(&self, state: &mut JobState, to: JobPhase) {
        info!(job = %self.job.job_id, from = %state.phase, %to, "job phase changed");
        state.phase = to;
        self.phase_tx.send_replace(to);
    }

    fn invalid_phase(&self, operation: &'static str, phase: JobPhase) -> CommitError {
        CommitError::InvalidPhase {
            job: self.job.job_id.clone(),
            operation,
            phase,
        }
    }
}

fn reject(attempt: &AttemptId, reason: String) -> CommitError {
    CommitError::AttemptRejected {
        attempt: attempt.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use common::{JobId, MemoryStore, OutputLayout};

    use crate::committer::FileOutputCommitter;

    use super::*;

    fn job(maps: u32, reduces: u32) -> JobContext {
        JobContext::new(JobId::new("test", 1), OutputLayout::new("out"), maps, reduces)
    }

    fn file_coordinator(
        store: Arc<dyn ObjectStore>,
        config: CommitterConfig,
        maps: u32,
        reduces: u32,
    ) -> Arc<CommitCoordinator> {
        let job = job(maps, reduces);
        let committer = Arc::new(FileOutputCommitter::new(store.clone(), job.layout.clone()));
        Arc::new(CommitCoordinator::new(job, config, committer, store))
    }

    async fn stage(
        store: &Arc<dyn ObjectStore>,
        coordinator: &CommitCoordinator,
        attempt: &AttemptId,
        data: &str,
    ) {
        coordinator.register_attempt(attempt).await.unwrap();
        let part = common::layout::join(
            &coordinator.work_dir(attempt),
            &common::layout::part_name(attempt.task()),
        );
        store.put(&part, Bytes::from(data.to_string())).await.unwrap();
    }

    /// Records which hooks ran; can be told to fail job commit or cleanup.
    #[derive(Debug, Default)]
    struct RecordingCommitter {
        calls: std::sync::Mutex<Vec<&'static str>>,
        fail_commit_job: bool,
        fail_cleanup: bool,
    }

    impl RecordingCommitter {
        fn record(&self, hook: &'static str) {
            self.calls.lock().unwrap().push(hook);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutputCommitter for RecordingCommitter {
        async fn setup_job(&self, _job: &JobContext) -> Result<()> {
            self.record("setup_job");
            Ok(())
        }

        async fn needs_task_commit(&self, _attempt: &AttemptId) -> Result<bool> {
            Ok(true)
        }

        async fn commit_task(&self, _attempt: &AttemptId) -> Result<()> {
            self.record("commit_task");
            Ok(())
        }

        async fn abort_task(&self, _attempt: &AttemptId) -> Result<()> {
            self.record("abort_task");
            Ok(())
        }

        async fn commit_job(&self, _job: &JobContext) -> Result<()> {
            self.record("commit_job");
            if self.fail_commit_job {
                bail!("marker write refused");
            }
            Ok(())
        }

        async fn abort_job(&self, _job: &JobContext, _phase: JobPhase) -> Result<()> {
            self.record("abort_job");
            Ok(())
        }

        async fn cleanup_job(&self, _job: &JobContext) -> Result<()> {
            self.record("cleanup_job");
            if self.fail_cleanup {
                bail!("temporary directory is busy");
            }
            Ok(())
        }

        fn work_dir(&self, attempt: &AttemptId) -> String {
            OutputLayout::new("out").attempt_staging_dir(attempt)
        }
    }

    fn recording_coordinator(
        committer: Arc<RecordingCommitter>,
        config: CommitterConfig,
        maps: u32,
        reduces: u32,
    ) -> CommitCoordinator {
        CommitCoordinator::new(job(maps, reduces), config, committer, Arc::new(MemoryStore::new()))
    }

    /// Fails every rename while `fail_renames` is set, every single-object
    /// delete while `fail_deletes` is set.
    #[derive(Debug, Default)]
    struct FaultyStore {
        inner: MemoryStore,
        fail_renames: AtomicBool,
        fail_deletes: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for FaultyStore {
        async fn put(&self, key: &str, data: Bytes) -> Result<()> {
            self.inner.put(key, data).await
        }

        async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<bool> {
            self.inner.put_if_absent(key, data).await
        }

        async fn get(&self, key: &str) -> Result<Bytes> {
            self.inner.get(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn list(&self, dir: &str) -> Result<Vec<String>> {
            self.inner.list(dir).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<()> {
            if self.fail_renames.load(Ordering::SeqCst) {
                bail!("injected rename failure");
            }
            self.inner.rename(from, to).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                bail!("injected delete failure");
            }
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, dir: &str) -> Result<()> {
            self.inner.delete_prefix(dir).await
        }
    }

    #[tokio::test]
    async fn concurrent_commits_have_exactly_one_winner() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let coordinator = file_coordinator(store.clone(), CommitterConfig::default(), 0, 1);
        coordinator.setup_job().await.unwrap();

        let task = coordinator.job().job_id.task(TaskKind::Reduce, 0);
        let first = task.attempt(0);
        let second = task.attempt(1);
        stage(&store, &coordinator, &first, "first\n").await;
        stage(&store, &coordinator, &second, "second\n").await;

        let (a, b) = tokio::join!(
            coordinator.commit_task(&first),
            coordinator.commit_task(&second)
        );
        let (winner, loser, loser_err) = match (a, b) {
            (Ok(()), Err(e)) => (&first, &second, e),
            (Err(e), Ok(())) => (&second, &first, e),
            other => panic!("expected exactly one winner, got {other:?}"),
        };

        assert!(loser_err.is_conflict());
        assert_eq!(coordinator.committed_attempt(&task).await.as_ref(), Some(winner));
        assert_eq!(coordinator.attempt_outcome(loser), Some(AttemptOutcome::Discarded));

        let expected = if winner == &first { "first\n" } else { "second\n" };
        let part = store.get(&coordinator.job().layout.final_part_key(&task)).await.unwrap();
        assert_eq!(part, Bytes::from(expected));
        assert!(store
            .list(&coordinator.job().layout.attempt_staging_dir(loser))
            .await
            .unwrap()
            .is_empty());

        let claim = store.get(&coordinator.job().layout.claim_key(&task)).await.unwrap();
        assert_eq!(claim, Bytes::from(winner.to_string()));
    }

    #[tokio::test]
    async fn needs_task_commit_is_stable() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let coordinator = file_coordinator(store.clone(), CommitterConfig::default(), 1, 0);
        coordinator.setup_job().await.unwrap();

        let attempt = coordinator.job().job_id.task(TaskKind::Map, 0).attempt(0);
        stage(&store, &coordinator, &attempt, "a\t1\n").await;

        assert!(coordinator.needs_task_commit(&attempt).await.unwrap());
        assert!(coordinator.needs_task_commit(&attempt).await.unwrap());
        assert_eq!(coordinator.attempt_outcome(&attempt), Some(AttemptOutcome::Running));
        assert!(!store.exists("out/part-m-00000").await.unwrap());

        let direct = file_coordinator(store, CommitterConfig::disabled(), 1, 0);
        assert!(!direct.needs_task_commit(&attempt).await.unwrap());
    }

    #[tokio::test]
    async fn failed_commit_releases_the_slot() {
        let faulty = Arc::new(FaultyStore::default());
        let store: Arc<dyn ObjectStore> = faulty.clone();
        let coordinator = file_coordinator(store.clone(), CommitterConfig::default(), 1, 0);
        coordinator.setup_job().await.unwrap();

        let task = coordinator.job().job_id.task(TaskKind::Map, 0);
        let first = task.attempt(0);
        stage(&store, &coordinator, &first, "lost\n").await;

        faulty.fail_renames.store(true, Ordering::SeqCst);
        let err = coordinator.commit_task(&first).await.unwrap_err();
        assert!(matches!(err, CommitError::CommitFailed { .. }));
        assert!(coordinator.committed_attempt(&task).await.is_none());
        assert!(!store.exists(&coordinator.job().layout.claim_key(&task)).await.unwrap());
        coordinator.abort_task(&first, TaskAbortReason::Failed).await;
        assert_eq!(coordinator.attempt_outcome(&first), Some(AttemptOutcome::Failed));

        faulty.fail_renames.store(false, Ordering::SeqCst);
        let retry = task.attempt(1);
        stage(&store, &coordinator, &retry, "kept\n").await;
        coordinator.commit_task(&retry).await.unwrap();

        assert_eq!(store.get("out/part-m-00000").await.unwrap(), Bytes::from("kept\n"));
        assert_eq!(coordinator.commit_job().await.unwrap().committed_maps, 1);
    }

    #[tokio::test]
    async fn stuck_claim_makes_task_unrecoverable() {
        let faulty = Arc::new(FaultyStore::default());
        let store: Arc<dyn ObjectStore> = faulty.clone();
        let coordinator = file_coordinator(store.clone(), CommitterConfig::default(), 1, 0);
        coordinator.setup_job().await.unwrap();

        let task = coordinator.job().job_id.task(TaskKind::Map, 0);
        let first = task.attempt(0);
        stage(&store, &coordinator, &first, "lost\n").await;

        faulty.fail_renames.store(true, Ordering::SeqCst);
        faulty.fail_deletes.store(true, Ordering::SeqCst);
        let err = coordinator.commit_task(&first).await.unwrap_err();
        assert!(err.is_unrecoverable(), "{err}");
        assert_eq!(coordinator.attempt_outcome(&first), Some(AttemptOutcome::Failed));

        faulty.fail_renames.store(false, Ordering::SeqCst);
        faulty.fail_deletes.store(false, Ordering::SeqCst);
        let retry = task.attempt(1);
        stage(&store, &coordinator, &retry, "kept\n").await;
        let err = coordinator.commit_task(&retry).await.unwrap_err();
        assert!(err.is_unrecoverable(), "{err}");
        assert!(!err.is_conflict());

        assert!(coordinator.committed_attempt(&task).await.is_none());
        assert!(matches!(
            coordinator.commit_job().await.unwrap_err(),
            CommitError::TasksUnresolved { .. }
        ));
        assert_eq!(coordinator.phase(), JobPhase::TasksRunning);
        assert!(!store.exists("out/part-m-00000").await.unwrap());
    }

    #[tokio::test]
    async fn claim_held_elsewhere_is_never_taken_as_committed() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let coordinator = file_coordinator(store.clone(), CommitterConfig::default(), 1, 0);
        coordinator.setup_job().await.unwrap();

        let task = coordinator.job().job_id.task(TaskKind::Map, 0);
        let elsewhere = task.attempt(7);
        let claim = coordinator.job().layout.claim_key(&task);
        store.put(&claim, Bytes::from(elsewhere.to_string())).await.unwrap();

        let attempt = task.attempt(0);
        stage(&store, &coordinator, &attempt, "mine\n").await;
        match coordinator.commit_task(&attempt).await.unwrap_err() {
            CommitError::CommitConflict { winner, .. } => assert_eq!(winner, elsewhere),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(coordinator.attempt_outcome(&attempt), Some(AttemptOutcome::Discarded));
        assert!(coordinator.committed_attempt(&task).await.is_none());
        assert!(coordinator.commit_job().await.is_err());

        // The other holder gave up; the task can still commit here.
        store.delete(&claim).await.unwrap();
        let retry = task.attempt(1);
        stage(&store, &coordinator, &retry, "retry\n").await;
        coordinator.commit_task(&retry).await.unwrap();
        assert_eq!(coordinator.committed_attempt(&task).await, Some(retry));
        assert_eq!(coordinator.commit_job().await.unwrap().committed_maps, 1);
    }

    #[tokio::test]
    async fn aborted_job_lists_no_uncommitted_output() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let coordinator = file_coordinator(store.clone(), CommitterConfig::default(), 0, 2);
        coordinator.setup_job().await.unwrap();

        let done = coordinator.job().job_id.task(TaskKind::Reduce, 0).attempt(0);
        let pending = coordinator.job().job_id.task(TaskKind::Reduce, 1).attempt(0);
        stage(&store, &coordinator, &done, "done\n").await;
        stage(&store, &coordinator, &pending, "pending\n").await;
        coordinator.commit_task(&done).await.unwrap();

        let cleanup = coordinator
            .abort_job(AbortReason::Failed, "reducer lost")
            .await
            .unwrap();
        assert!(matches!(cleanup, CleanupOutcome::Ran));
        assert_eq!(coordinator.phase(), JobPhase::Failed);
        assert_eq!(coordinator.attempt_outcome(&pending), Some(AttemptOutcome::Discarded));

        let listed = store.list("out").await.unwrap();
        assert_eq!(listed, vec!["out/part-r-00000".to_string()]);
        assert!(coordinator.register_attempt(&pending.task().attempt(1)).await.is_err());
        assert!(matches!(
            coordinator.cleanup_job().await.unwrap(),
            CleanupOutcome::AlreadyDone
        ));
    }

    #[tokio::test]
    async fn direct_output_of_aborted_task_is_removed() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let coordinator = file_coordinator(store.clone(), CommitterConfig::disabled(), 1, 0);
        coordinator.setup_job().await.unwrap();

        let attempt = coordinator.job().job_id.task(TaskKind::Map, 0).attempt(0);
        stage(&store, &coordinator, &attempt, "half\n").await;
        assert!(store.exists("out/part-m-00000").await.unwrap());

        coordinator.abort_task(&attempt, TaskAbortReason::Failed).await;
        assert!(!store.exists("out/part-m-00000").await.unwrap());
    }

    #[tokio::test]
    async fn job_without_tasks_succeeds_vacuously() {
        let committer = Arc::new(RecordingCommitter::default());
        let coordinator = recording_coordinator(committer.clone(), CommitterConfig::default(), 0, 0);

        assert_eq!(coordinator.setup_job().await.unwrap(), PhaseOutcome::Ran);
        let summary = coordinator.commit_job().await.unwrap();

        assert_eq!(summary, JobSummary::default());
        assert_eq!(summary.to_string(), "0 committed map tasks, 0 committed reduce tasks");
        assert_eq!(coordinator.phase(), JobPhase::Succeeded);
        assert!(coordinator.cleanup_job().await.unwrap().ran());
        assert_eq!(committer.calls(), vec!["setup_job", "commit_job", "cleanup_job"]);
    }

    #[tokio::test]
    async fn disabled_job_phases_never_run() {
        let committer = Arc::new(RecordingCommitter::default());
        let config = CommitterConfig::default().without_job_setup_cleanup();
        let coordinator = recording_coordinator(committer.clone(), config, 1, 0);

        assert_eq!(coordinator.setup_job().await.unwrap(), PhaseOutcome::Skipped);
        assert_eq!(coordinator.phase(), JobPhase::TasksRunning);

        let attempt = coordinator.job().job_id.task(TaskKind::Map, 0).attempt(0);
        coordinator.register_attempt(&attempt).await.unwrap();
        coordinator.commit_task(&attempt).await.unwrap();
        coordinator.commit_job().await.unwrap();
        assert!(matches!(
            coordinator.cleanup_job().await.unwrap(),
            CleanupOutcome::Skipped
        ));

        assert_eq!(committer.calls(), vec!["commit_task"]);
    }

    #[tokio::test]
    async fn job_commit_failure_is_reported_after_tasks_committed() {
        let committer = Arc::new(RecordingCommitter {
            fail_commit_job: true,
            ..Default::default()
        });
        let coordinator = recording_coordinator(committer, CommitterConfig::default(), 1, 0);
        coordinator.setup_job().await.unwrap();

        let attempt = coordinator.job().job_id.task(TaskKind::Map, 0).attempt(0);
        coordinator.register_attempt(&attempt).await.unwrap();
        coordinator.commit_task(&attempt).await.unwrap();

        let err = coordinator.commit_job().await.unwrap_err();
        assert!(matches!(err, CommitError::JobCommitFailed { .. }));
        assert_eq!(coordinator.phase(), JobPhase::Failed);
        assert_eq!(coordinator.committed_attempt(attempt.task()).await, Some(attempt.clone()));
        assert!(coordinator.cleanup_job().await.unwrap().ran());
    }

    #[tokio::test]
    async fn cleanup_failure_keeps_the_verdict() {
        let committer = Arc::new(RecordingCommitter {
            fail_cleanup: true,
            ..Default::default()
        });
        let coordinator = recording_coordinator(committer.clone(), CommitterConfig::default(), 0, 0);
        coordinator.setup_job().await.unwrap();
        coordinator.commit_job().await.unwrap();

        let outcome = coordinator.cleanup_job().await.unwrap();
        assert!(matches!(
            outcome,
            CleanupOutcome::Failed(CommitError::CleanupFailed { .. })
        ));
        assert_eq!(coordinator.phase(), JobPhase::Succeeded);
        assert!(matches!(
            coordinator.cleanup_job().await.unwrap(),
            CleanupOutcome::AlreadyDone
        ));
        assert_eq!(
            committer.calls().iter().filter(|c| **c == "cleanup_job").count(),
            1
        );
    }

    #[tokio::test]
    async fn job_commit_waits_for_every_task() {
        let committer = Arc::new(RecordingCommitter::default());
        let coordinator = recording_coordinator(committer, CommitterConfig::default(), 2, 0);
        coordinator.setup_job().await.unwrap();

        let attempt = coordinator.job().job_id.task(TaskKind::Map, 0).attempt(0);
        coordinator.register_attempt(&attempt).await.unwrap();

        match coordinator.commit_job().await.unwrap_err() {
            CommitError::TasksUnresolved {
                uncommitted,
                in_flight,
                ..
            } => {
                assert_eq!(uncommitted.len(), 2);
                assert_eq!(in_flight, 1);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(coordinator.phase(), JobPhase::TasksRunning);
        assert!(coordinator.cleanup_job().await.is_err());
    }

    #[tokio::test]
    async fn attempts_are_validated() {
        let committer = Arc::new(RecordingCommitter::default());
        let coordinator = recording_coordinator(committer, CommitterConfig::default(), 1, 0);
        let job_id = coordinator.job().job_id.clone();

        let out_of_range = job_id.task(TaskKind::Map, 1).attempt(0);
        let wrong_kind = job_id.task(TaskKind::Reduce, 0).attempt(0);
        let foreign = JobId::new("test", 2).task(TaskKind::Map, 0).attempt(0);
        for attempt in [&out_of_range, &wrong_kind, &foreign] {
            let err = coordinator.register_attempt(attempt).await.unwrap_err();
            assert!(matches!(err, CommitError::AttemptRejected { .. }), "{err}");
        }

        let attempt = job_id.task(TaskKind::Map, 0).attempt(0);
        coordinator.register_attempt(&attempt).await.unwrap();
        assert!(coordinator.register_attempt(&attempt).await.is_err());
    }

    #[tokio::test]
    async fn phase_changes_are_published() {
        let committer = Arc::new(RecordingCommitter::default());
        let coordinator = recording_coordinator(committer, CommitterConfig::default(), 0, 0);
        let mut phases = coordinator.subscribe();

        coordinator.setup_job().await.unwrap();
        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), JobPhase::TasksRunning);

        coordinator
            .abort_job(AbortReason::Killed, "killed by user")
            .await
            .unwrap();
        assert_eq!(*phases.borrow_and_update(), JobPhase::Aborted);
        assert!(coordinator
            .abort_job(AbortReason::Killed, "again")
            .await
            .is_err());
    }
}
