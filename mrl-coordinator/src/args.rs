use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Run a MapReduce job and commit its output", long_about = None)]
pub struct Args {
    /// Store holding inputs and output: file:///dir, mem:// or s3://bucket.
    #[arg(long, default_value = "file:///tmp/mrl")]
    pub store: String,

    /// Glob of the input objects, one map task per match.
    #[arg(short, long)]
    pub input: String,

    /// Output location inside the store.
    #[arg(short, long)]
    pub output: String,

    /// Workload to run.
    #[arg(short, long, default_value = "wc")]
    pub workload: String,

    /// Number of reduce tasks. Zero makes the map output final.
    #[arg(short = 'r', long, default_value_t = 1)]
    pub reduces: u32,

    /// Skip job setup and job cleanup.
    #[arg(long)]
    pub no_job_setup_cleanup: bool,

    /// Let attempts write straight into the output location.
    #[arg(long)]
    pub no_task_commit: bool,

    /// Race a speculative duplicate against every task.
    #[arg(long)]
    pub speculative: bool,

    /// Attempts a task may fail before the job fails.
    #[arg(long, default_value_t = 4)]
    pub max_attempts: u32,

    /// Cluster name used in job ids.
    #[arg(long, default_value = "local")]
    pub cluster: String,

    /// Minio access key / user ID.
    #[arg(long, default_value = "robert")]
    pub access_key_id: String,

    /// Minio secret key / password.
    #[arg(long, default_value = "robertisawesome")]
    pub secret_access_key: String,

    /// Minio region.
    #[arg(long, default_value = "us-east-1")]
    pub region: String,

    #[arg(long, default_value = "http://127.0.0.1:9000")]
    pub minio_url: String,

    /// Auxiliary arguments to pass to the MapReduce application.
    #[arg(last = true)]
    pub args: Vec<String>,
}
