//! Where job output lives, in staging and once committed.
//!
//! ```text
//! <output>/part-r-00000                               committed part
//! <output>/_SUCCESS                                   job commit marker
//! <output>/_temporary/<job>/                          job staging
//! <output>/_temporary/<job>/<attempt>/part-r-00000    attempt staging
//! <output>/_temporary/<job>/<attempt>/_shuffle/r-00001  map spill
//! <output>/_temporary/<job>/_claims/<task>            commit claim
//! ```
//!
//! Everything that is not a data part starts with [`RESERVED_PREFIX`], so a
//! reader that skips those names sees exactly one part per committed task.

use crate::ids::{AttemptId, JobId, TaskId};

/// Names starting with this are never job data.
pub const RESERVED_PREFIX: char = '_';

pub const TEMPORARY_DIR: &str = "_temporary";
pub const SUCCESS_MARKER: &str = "_SUCCESS";
const CLAIMS_DIR: &str = "_claims";
const SHUFFLE_DIR: &str = "_shuffle";

/// Join two key fragments with a single `/`.
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// The last segment of a key.
pub fn file_name(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or(key)
}

/// Whether a name is a marker or temporary rather than data.
pub fn is_hidden(name: &str) -> bool {
    file_name(name).starts_with(RESERVED_PREFIX)
}

/// Keep only data names, sorted.
pub fn visible<I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut names: Vec<String> = names.into_iter().filter(|n| !is_hidden(n)).collect();
    names.sort();
    names
}

/// Name of the part a task produces. Depends on nothing but the task id, so
/// a commit never needs to coordinate with other tasks.
pub fn part_name(task: &TaskId) -> String {
    format!("part-{}-{:05}", task.kind().code(), task.index())
}

/// Name of the spill a map attempt writes for one reducer.
pub fn spill_name(reduce_index: u32) -> String {
    format!("r-{reduce_index:05}")
}

/// Maps job, task and attempt ids onto keys below one output location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLayout {
    output: String,
}

impl OutputLayout {
    pub fn new(output: impl Into<String>) -> Self {
        let output: String = output.into();
        Self {
            output: output.trim_matches('/').to_string(),
        }
    }

    pub fn output_dir(&self) -> &str {
        &self.output
    }

    pub fn temporary_dir(&self) -> String {
        join(&self.output, TEMPORARY_DIR)
    }

    pub fn job_staging_dir(&self, job: &JobId) -> String {
        join(&self.temporary_dir(), &job.to_string())
    }

    /// Private to one attempt. Two attempts of the same task never share it.
    pub fn attempt_staging_dir(&self, attempt: &AttemptId) -> String {
        join(&self.job_staging_dir(attempt.job()), &attempt.to_string())
    }

    pub fn claims_dir(&self, job: &JobId) -> String {
        join(&self.job_staging_dir(job), CLAIMS_DIR)
    }

    pub fn claim_key(&self, task: &TaskId) -> String {
        join(&self.claims_dir(task.job()), &task.to_string())
    }

    pub fn shuffle_dir(&self, map_attempt: &AttemptId) -> String {
        join(&self.attempt_staging_dir(map_attempt), SHUFFLE_DIR)
    }

    pub fn spill_key(&self, map_attempt: &AttemptId, reduce_index: u32) -> String {
        join(&self.shuffle_dir(map_attempt), &spill_name(reduce_index))
    }

    pub fn final_part_key(&self, task: &TaskId) -> String {
        join(&self.output, &part_name(task))
    }

    pub fn staged_part_key(&self, attempt: &AttemptId) -> String {
        join(&self.attempt_staging_dir(attempt), &part_name(attempt.task()))
    }

    pub fn success_marker_key(&self) -> String {
        join(&self.output, SUCCESS_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TaskKind;

    fn job() -> JobId {
        JobId::new("local", 1)
    }

    #[test]
    fn part_names_are_padded_and_sortable() {
        let parts: Vec<String> = [10, 2, 0]
            .into_iter()
            .map(|i| part_name(&job().task(TaskKind::Reduce, i)))
            .collect();
        assert_eq!(parts, ["part-r-00010", "part-r-00002", "part-r-00000"]);

        let sorted = visible(parts);
        assert_eq!(sorted, ["part-r-00000", "part-r-00002", "part-r-00010"]);
        assert_eq!(part_name(&job().task(TaskKind::Map, 7)), "part-m-00007");
    }

    #[test]
    fn speculative_attempts_stage_apart() {
        let layout = OutputLayout::new("wc/output/");
        let task = job().task(TaskKind::Map, 0);

        let first = layout.attempt_staging_dir(&task.attempt(0));
        let second = layout.attempt_staging_dir(&task.attempt(1));
        assert_ne!(first, second);
        assert_eq!(
            layout.staged_part_key(&task.attempt(1)),
            "wc/output/_temporary/job_local_0001/attempt_local_0001_m_000000_1/part-m-00000"
        );
        assert_eq!(layout.final_part_key(&task), "wc/output/part-m-00000");
    }

    #[test]
    fn hidden_filter_drops_markers_only() {
        let layout = OutputLayout::new("out");
        let listing = vec![
            "part-r-00000".to_string(),
            file_name(&layout.success_marker_key()).to_string(),
            file_name(&layout.temporary_dir()).to_string(),
            "part-r-00001".to_string(),
        ];
        assert_eq!(visible(listing), ["part-r-00000", "part-r-00001"]);
        assert!(is_hidden(&layout.claims_dir(&job())));
        assert!(is_hidden(&layout.shuffle_dir(&job().task(TaskKind::Map, 0).attempt(0))));
    }

    #[test]
    fn join_handles_empty_segments() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/", "/b"), "a/b");
        assert_eq!(join("a", ""), "a");
        assert_eq!(file_name("a/b/c"), "c");
        assert_eq!(file_name("c"), "c");
    }
}
