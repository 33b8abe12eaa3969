//! Output committers and output formats.
//!
//! A committer owns the storage side of the commit protocol: where attempts
//! stage their output and how staged output becomes final. The coordinator
//! decides *when* each hook runs.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use common::layout::{is_hidden, join};
use common::{AttemptId, JobId, ObjectStore, OutputLayout};

use crate::error::CommitError;
use crate::jobs::JobPhase;

/// What a committer knows about the job it works for.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub layout: OutputLayout,
    pub num_maps: u32,
    pub num_reduces: u32,
}

impl JobContext {
    pub fn new(job_id: JobId, layout: OutputLayout, num_maps: u32, num_reduces: u32) -> Self {
        Self {
            job_id,
            layout,
            num_maps,
            num_reduces,
        }
    }
}

/// Storage hooks of the commit protocol.
#[async_trait]
pub trait OutputCommitter: Send + Sync + fmt::Debug {
    /// Create the job's scaffolding.
    async fn setup_job(&self, job: &JobContext) -> Result<()>;

    /// Whether the attempt staged anything that has to be moved. Must not
    /// change anything.
    async fn needs_task_commit(&self, attempt: &AttemptId) -> Result<bool>;

    /// Make the attempt's staged output final.
    async fn commit_task(&self, attempt: &AttemptId) -> Result<()>;

    /// Drop the attempt's staged output.
    async fn abort_task(&self, attempt: &AttemptId) -> Result<()>;

    /// Finalize the job once every task committed.
    async fn commit_job(&self, job: &JobContext) -> Result<()>;

    /// Drop whatever the job staged. `phase` is the terminal phase it ended in.
    async fn abort_job(&self, job: &JobContext, phase: JobPhase) -> Result<()>;

    /// Remove the job's scaffolding.
    async fn cleanup_job(&self, job: &JobContext) -> Result<()>;

    /// Where an attempt writes when its output is staged.
    fn work_dir(&self, attempt: &AttemptId) -> String;
}

/// Stages every attempt below `<output>/_temporary/<job>/<attempt>/` and
/// commits it by renaming its data files into the output location.
#[derive(Debug, Clone)]
pub struct FileOutputCommitter {
    store: Arc<dyn ObjectStore>,
    layout: OutputLayout,
}

impl FileOutputCommitter {
    pub fn new(store: Arc<dyn ObjectStore>, layout: OutputLayout) -> Self {
        Self { store, layout }
    }

    /// Staged data files of an attempt, relative to its staging directory.
    /// Hidden entries (spills, temporaries) are never published.
    async fn staged_files(&self, attempt: &AttemptId) -> Result<Vec<String>> {
        let staging = self.layout.attempt_staging_dir(attempt);
        let keys = self
            .store
            .list(&staging)
            .await
            .with_context(|| format!("failed to list staging of {attempt}"))?;

        let prefix = format!("{staging}/");
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .filter(|relative| !relative.split('/').any(is_hidden))
            .collect())
    }
}

#[async_trait]
impl OutputCommitter for FileOutputCommitter {
    async fn setup_job(&self, job: &JobContext) -> Result<()> {
        let staging = self.layout.job_staging_dir(&job.job_id);
        self.store
            .mkdirs(&staging)
            .await
            .with_context(|| format!("failed to create `{staging}`"))?;
        debug!(job = %job.job_id, %staging, "created job staging");
        Ok(())
    }

    async fn needs_task_commit(&self, attempt: &AttemptId) -> Result<bool> {
        Ok(!self.staged_files(attempt).await?.is_empty())
    }

    async fn commit_task(&self, attempt: &AttemptId) -> Result<()> {
        let staging = self.layout.attempt_staging_dir(attempt);
        for relative in self.staged_files(attempt).await? {
            let from = join(&staging, &relative);
            let to = join(self.layout.output_dir(), &relative);
            self.store
                .rename(&from, &to)
                .await
                .with_context(|| format!("failed to move `{from}` to `{to}`"))?;
            debug!(%attempt, part = %to, "published part");
        }
        Ok(())
    }

    async fn abort_task(&self, attempt: &AttemptId) -> Result<()> {
        self.store
            .delete_prefix(&self.layout.attempt_staging_dir(attempt))
            .await
            .with_context(|| format!("failed to discard staging of {attempt}"))
    }

    async fn commit_job(&self, job: &JobContext) -> Result<()> {
        let marker = self.layout.success_marker_key();
        self.store
            .put(&marker, bytes::Bytes::new())
            .await
            .with_context(|| format!("failed to write `{marker}`"))?;
        info!(job = %job.job_id, %marker, "wrote commit marker");
        Ok(())
    }

    async fn abort_job(&self, job: &JobContext, phase: JobPhase) -> Result<()> {
        debug!(job = %job.job_id, %phase, "discarding job staging");
        self.store
            .delete_prefix(&self.layout.job_staging_dir(&job.job_id))
            .await
            .context("failed to discard job staging")
    }

    async fn cleanup_job(&self, job: &JobContext) -> Result<()> {
        let temporary = self.layout.temporary_dir();
        self.store
            .delete_prefix(&temporary)
            .await
            .with_context(|| format!("failed to remove `{temporary}` of {}", job.job_id))
    }

    fn work_dir(&self, attempt: &AttemptId) -> String {
        self.layout.attempt_staging_dir(attempt)
    }
}

/// Publishes nothing. Attempts still write to staging, which is thrown away
/// when an attempt aborts and when the job ends.
#[derive(Debug, Clone)]
pub struct NullOutputCommitter {
    store: Arc<dyn ObjectStore>,
    layout: OutputLayout,
}

impl NullOutputCommitter {
    pub fn new(store: Arc<dyn ObjectStore>, layout: OutputLayout) -> Self {
        Self { store, layout }
    }
}

#[async_trait]
impl OutputCommitter for NullOutputCommitter {
    async fn setup_job(&self, _job: &JobContext) -> Result<()> {
        Ok(())
    }

    async fn needs_task_commit(&self, _attempt: &AttemptId) -> Result<bool> {
        Ok(false)
    }

    async fn commit_task(&self, _attempt: &AttemptId) -> Result<()> {
        Ok(())
    }

    async fn abort_task(&self, attempt: &AttemptId) -> Result<()> {
        self.store
            .delete_prefix(&self.layout.attempt_staging_dir(attempt))
            .await
            .with_context(|| format!("failed to discard staging of {attempt}"))
    }

    async fn commit_job(&self, _job: &JobContext) -> Result<()> {
        Ok(())
    }

    async fn abort_job(&self, job: &JobContext, _phase: JobPhase) -> Result<()> {
        self.store
            .delete_prefix(&self.layout.job_staging_dir(&job.job_id))
            .await
            .context("failed to discard job staging")
    }

    /// Staging of committed attempts is only dropped here, since reducers
    /// read the spills of committed maps.
    async fn cleanup_job(&self, job: &JobContext) -> Result<()> {
        let temporary = self.layout.temporary_dir();
        self.store
            .delete_prefix(&temporary)
            .await
            .with_context(|| format!("failed to remove `{temporary}` of {}", job.job_id))
    }

    fn work_dir(&self, attempt: &AttemptId) -> String {
        self.layout.attempt_staging_dir(attempt)
    }
}

/// Validates a job's output location and picks its committer.
#[async_trait]
pub trait OutputFormat: Send + Sync + fmt::Debug {
    /// Runs before anything else of the job.
    async fn check_output_specs(
        &self,
        store: &Arc<dyn ObjectStore>,
        job: &JobContext,
    ) -> Result<(), CommitError>;

    fn committer(&self, store: Arc<dyn ObjectStore>, job: &JobContext) -> Arc<dyn OutputCommitter>;
}

/// Text parts committed through a [`FileOutputCommitter`]. Refuses an output
/// location that already holds data.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOutputFormat;

#[async_trait]
impl OutputFormat for TextOutputFormat {
    async fn check_output_specs(
        &self,
        store: &Arc<dyn ObjectStore>,
        job: &JobContext,
    ) -> Result<(), CommitError> {
        let output = job.layout.output_dir();
        let prefix = format!("{output}/");
        let existing = store.list(output).await?;
        if existing
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .any(|relative| !relative.split('/').any(is_hidden))
        {
            return Err(CommitError::OutputAlreadyExists(output.to_string()));
        }
        Ok(())
    }

    fn committer(&self, store: Arc<dyn ObjectStore>, job: &JobContext) -> Arc<dyn OutputCommitter> {
        Arc::new(FileOutputCommitter::new(store, job.layout.clone()))
    }
}

/// For jobs whose output nobody reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutputFormat;

#[async_trait]
impl OutputFormat for NullOutputFormat {
    async fn check_output_specs(
        &self,
        _store: &Arc<dyn ObjectStore>,
        _job: &JobContext,
    ) -> Result<(), CommitError> {
        Ok(())
    }

    fn committer(&self, store: Arc<dyn ObjectStore>, job: &JobContext) -> Arc<dyn OutputCommitter> {
        Arc::new(NullOutputCommitter::new(store, job.layout.clone()))
    }
}
