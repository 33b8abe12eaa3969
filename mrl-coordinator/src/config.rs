use bytes::Bytes;

/// Which commit phases run for a job.
///
/// Fixed when the coordinator is built, so jobs in one process never see
/// each other's settings. The flags are independent; a disabled phase is
/// skipped outright and must not assume the output location exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitterConfig {
    pub needs_job_setup: bool,

    /// Also gates job-level output finalization (the commit marker) and the
    /// job-level abort hook, which belong to the cleanup phase.
    pub needs_job_cleanup: bool,

    /// When off, attempts write straight into the final output location.
    pub needs_task_commit: bool,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            needs_job_setup: true,
            needs_job_cleanup: true,
            needs_task_commit: true,
        }
    }
}

impl CommitterConfig {
    pub fn without_job_setup_cleanup(self) -> Self {
        Self {
            needs_job_setup: false,
            needs_job_cleanup: false,
            ..self
        }
    }

    /// Every phase off: tasks write directly to the output, job transitions
    /// are bookkeeping only.
    pub fn disabled() -> Self {
        Self {
            needs_job_setup: false,
            needs_job_cleanup: false,
            needs_task_commit: false,
        }
    }
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_TASK_SLOTS: usize = 4;

/// A job as submitted to the driver.
#[derive(Debug, Clone)]
pub struct JobConf {
    /// Input objects, one map task each.
    pub inputs: Vec<String>,

    /// Output location, e.g. `wc/output`.
    pub output: String,

    /// Name of the workload to run.
    pub workload: String,

    /// Auxiliary arguments to pass to the MapReduce application.
    pub args: Vec<String>,

    pub num_reduces: u32,
    pub committer: CommitterConfig,

    /// Attempts a task may fail before the job fails.
    pub max_attempts: u32,

    /// Race a duplicate attempt against every task. Ignored when task commit
    /// is disabled, since duplicates would write the same final part.
    pub speculative: bool,

    /// Attempts running at once.
    pub task_slots: usize,
}

impl JobConf {
    pub fn new(output: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            inputs: vec![],
            output: output.into(),
            workload: workload.into(),
            args: vec![],
            num_reduces: 1,
            committer: CommitterConfig::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            speculative: false,
            task_slots: DEFAULT_TASK_SLOTS,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_reduces(mut self, num_reduces: u32) -> Self {
        self.num_reduces = num_reduces;
        self
    }

    pub fn with_committer(mut self, committer: CommitterConfig) -> Self {
        self.committer = committer;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_speculation(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn num_maps(&self) -> u32 {
        self.inputs.len() as u32
    }

    pub fn aux(&self) -> Bytes {
        Bytes::from(self.args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_toggle_independently() {
        let config = CommitterConfig::default().without_job_setup_cleanup();
        assert!(!config.needs_job_setup);
        assert!(!config.needs_job_cleanup);
        assert!(config.needs_task_commit);

        let none = CommitterConfig::disabled();
        assert!(!none.needs_task_commit);
    }

    #[test]
    fn job_conf_defaults() {
        let conf = JobConf::new("out", "wc")
            .with_inputs(vec!["in/0".into(), "in/1".into()])
            .with_args(vec!["a".into(), "b".into()])
            .with_max_attempts(0);

        assert_eq!(conf.num_maps(), 2);
        assert_eq!(conf.num_reduces, 1);
        assert_eq!(conf.max_attempts, 1);
        assert_eq!(conf.aux(), Bytes::from("a b"));
        assert_eq!(conf.committer, CommitterConfig::default());
    }
}
