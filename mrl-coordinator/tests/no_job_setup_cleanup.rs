//! Jobs run end to end against an on-disk store.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use common::layout::visible;
use common::{LocalStore, ObjectStore, TaskKind};
use mrl_coordinator::{
    CommitError, CommitterConfig, JobConf, JobContext, JobPhase, LocalJobRunner, NullOutputFormat,
    OutputCommitter, OutputFormat, TaskState, TextOutputFormat,
};

/// Runs the committer's job setup while checking the output, so the output
/// location exists even when the job itself skips setup.
#[derive(Debug, Default)]
struct EagerSetupOutputFormat;

#[async_trait]
impl OutputFormat for EagerSetupOutputFormat {
    async fn check_output_specs(
        &self,
        store: &Arc<dyn ObjectStore>,
        job: &JobContext,
    ) -> Result<(), CommitError> {
        TextOutputFormat.check_output_specs(store, job).await?;
        self.committer(store.clone(), job).setup_job(job).await?;
        Ok(())
    }

    fn committer(&self, store: Arc<dyn ObjectStore>, job: &JobContext) -> Arc<dyn OutputCommitter> {
        TextOutputFormat.committer(store, job)
    }
}

async fn runner(inputs: &[&str]) -> (TempDir, LocalJobRunner) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    for (i, text) in inputs.iter().enumerate() {
        store
            .put(&format!("input/part-{i}"), Bytes::from(text.to_string()))
            .await
            .unwrap();
    }
    (dir, LocalJobRunner::new(store))
}

fn input_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("input/part-{i}")).collect()
}

async fn visible_parts(runner: &LocalJobRunner, output: &str) -> Vec<String> {
    visible(runner.store().list_dir(output).await.unwrap())
}

#[tokio::test]
async fn no_job_setup_cleanup_leaves_no_setup_or_cleanup_tasks() {
    let (_dir, runner) = runner(&["hello world", "hello again"]).await;

    for (maps, reduces) in [(1, 1), (1, 0), (0, 0), (0, 1)] {
        let output = format!("output-{maps}-{reduces}");
        let conf = JobConf::new(output.as_str(), "wc")
            .with_inputs(input_keys(maps))
            .with_reduces(reduces)
            .with_committer(CommitterConfig::default().without_job_setup_cleanup());

        let report = runner
            .run_job_with(conf, Arc::new(EagerSetupOutputFormat))
            .await
            .unwrap();
        assert!(report.is_successful(), "({maps}, {reduces}): {report:?}");

        let job = &report.job_id;
        for kind in [TaskKind::JobSetup, TaskKind::JobCleanup] {
            let tasks = runner.task_reports(job, kind).await.unwrap();
            assert!(tasks.is_empty(), "({maps}, {reduces}) ran {kind} tasks");
        }
        assert_eq!(
            runner.task_reports(job, TaskKind::Map).await.unwrap().len(),
            maps
        );
        assert_eq!(
            runner.task_reports(job, TaskKind::Reduce).await.unwrap().len(),
            reduces as usize
        );

        assert!(runner.store().is_dir(&output).await.unwrap());
        let expected = if reduces > 0 { reduces as usize } else { maps };
        let parts = visible_parts(&runner, &output).await;
        assert_eq!(parts.len(), expected, "({maps}, {reduces}): {parts:?}");
        assert!(parts.iter().all(|p| p.starts_with("part-")));
    }
}

#[tokio::test]
async fn default_committer_marks_success_and_cleans_up() {
    let (_dir, runner) = runner(&["b a b", "a c"]).await;
    let conf = JobConf::new("output", "wc").with_inputs(input_keys(2));

    let report = runner.run_job(conf).await.unwrap();
    assert!(report.is_successful());
    assert_eq!(report.setup_tasks.len(), 1);
    assert_eq!(report.cleanup_tasks.len(), 1);

    let listed = runner.store().list_dir("output").await.unwrap();
    assert_eq!(listed, vec!["_SUCCESS".to_string(), "part-r-00000".to_string()]);
    let part = runner.store().get("output/part-r-00000").await.unwrap();
    assert_eq!(part, Bytes::from("a\t2\nb\t2\nc\t1\n"));
}

#[tokio::test]
async fn speculative_attempts_commit_once_per_task() {
    let (_dir, runner) = runner(&["b a b", "a c"]).await;
    let conf = JobConf::new("output", "wc")
        .with_inputs(input_keys(2))
        .with_speculation(true);

    let report = runner.run_job(conf).await.unwrap();
    assert!(report.is_successful(), "{report:?}");

    for task in report.map_tasks.iter().chain(&report.reduce_tasks) {
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempts, 2);
        let winner = task.committed_attempt.as_ref().unwrap();
        assert_eq!(winner.task(), &task.task);
    }

    assert_eq!(visible_parts(&runner, "output").await, vec!["part-r-00000"]);
    let part = runner.store().get("output/part-r-00000").await.unwrap();
    assert_eq!(part, Bytes::from("a\t2\nb\t2\nc\t1\n"));
}

#[tokio::test]
async fn killed_job_is_aborted_without_output() {
    let (_dir, runner) = runner(&["x y z"]).await;
    let conf = JobConf::new("output", "wc").with_inputs(input_keys(1));

    let job = runner
        .submit(conf, Arc::new(TextOutputFormat))
        .await
        .unwrap();
    job.kill();
    let report = job.wait().await.unwrap();

    assert_eq!(report.phase, JobPhase::Aborted);
    assert!(!report.is_successful());
    assert_eq!(report.map_tasks[0].state, TaskState::Killed);
    assert!(report.reduce_tasks.is_empty());
    assert_eq!(report.cleanup_tasks.len(), 1);
    assert!(visible_parts(&runner, "output").await.is_empty());
    assert!(runner.running_jobs().is_empty());
}

#[tokio::test]
async fn failed_direct_write_job_keeps_no_uncommitted_part() {
    // The second input is never written, so its map cannot read it.
    let (_dir, runner) = runner(&["keep me"]).await;
    let conf = JobConf::new("output", "grep")
        .with_inputs(input_keys(2))
        .with_args(vec!["keep".into()])
        .with_reduces(0)
        .with_max_attempts(2)
        .with_committer(CommitterConfig::disabled());

    let report = runner.run_job(conf).await.unwrap();
    assert_eq!(report.phase, JobPhase::Failed);
    assert!(report.setup_tasks.is_empty());
    assert!(report.cleanup_tasks.is_empty());
    assert_eq!(report.map_tasks[1].state, TaskState::Failed);

    assert!(!runner.store().exists("output/part-m-00001").await.unwrap());
}

#[tokio::test]
async fn null_output_format_publishes_nothing() {
    let (_dir, runner) = runner(&["a b"]).await;
    let conf = JobConf::new("output", "wc")
        .with_inputs(input_keys(1))
        .with_reduces(0);

    let report = runner
        .run_job_with(conf, Arc::new(NullOutputFormat))
        .await
        .unwrap();
    assert!(report.is_successful());
    assert_eq!(report.summary.unwrap().committed_maps, 1);
    assert!(!runner.store().exists("output/_SUCCESS").await.unwrap());
    assert!(runner.store().list("output").await.unwrap().is_empty());
}
