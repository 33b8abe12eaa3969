mod args;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use args::Args;
use common::layout::visible;
use common::{minio, storage, ObjectStore};
use mrl_coordinator::{CommitterConfig, JobConf, LocalJobRunner};

/// Longest `/`-terminated prefix of a glob without wildcards.
fn glob_root(pattern: &str) -> &str {
    let literal = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .map_or(pattern, |at| &pattern[..at]);
    literal.rfind('/').map_or("", |at| &pattern[..at])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let minio_client_config = minio::ClientConfig {
        access_key_id: args.access_key_id,
        secret_access_key: args.secret_access_key,
        region: args.region,
        url: args.minio_url,
    };
    let store: Arc<dyn ObjectStore> = storage::open_store(&args.store, Some(minio_client_config))?;

    let inputs = storage::glob_keys(store.as_ref(), glob_root(&args.input), &args.input).await?;
    if inputs.is_empty() {
        info!(pattern = %args.input, "no input matched, running a job without map tasks");
    }

    let mut committer = CommitterConfig::default();
    if args.no_job_setup_cleanup {
        committer = committer.without_job_setup_cleanup();
    }
    committer.needs_task_commit = !args.no_task_commit;

    let conf = JobConf::new(args.output.as_str(), args.workload.as_str())
        .with_inputs(inputs)
        .with_reduces(args.reduces)
        .with_committer(committer)
        .with_args(args.args)
        .with_speculation(args.speculative)
        .with_max_attempts(args.max_attempts);

    let runner = LocalJobRunner::with_cluster(store.clone(), args.cluster);
    let report = runner.run_job(conf).await?;

    println!("{} {}", report.job_id, report.phase);
    if let Some(summary) = report.summary {
        println!("{summary}");
    }
    println!(
        "tasks: {} setup, {} map, {} reduce, {} cleanup",
        report.setup_tasks.len(),
        report.map_tasks.len(),
        report.reduce_tasks.len(),
        report.cleanup_tasks.len()
    );
    for part in visible(store.list_dir(&args.output).await?) {
        println!("{part}");
    }

    if !report.is_successful() {
        bail!(
            "{} did not succeed: {}",
            report.job_id,
            report.failure.unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_root_stops_before_wildcards() {
        assert_eq!(glob_root("input/*.txt"), "input");
        assert_eq!(glob_root("data/2024/part-?"), "data/2024");
        assert_eq!(glob_root("*.txt"), "");
        assert_eq!(glob_root("input/plain"), "input");
    }
}
