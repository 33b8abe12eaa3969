//! MapReduce applications bundled with the cluster.

use common::Workload;

pub mod grep;
pub mod wc;

/// Look up a workload by the name a job is submitted with.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" => Some(Workload {
            map_fn: wc::map,
            reduce_fn: wc::reduce,
        }),
        "grep" => Some(Workload {
            map_fn: grep::map,
            reduce_fn: grep::reduce,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_workloads_resolve() {
        assert!(try_named("wc").is_some());
        assert!(try_named("grep").is_some());
        assert!(try_named("matrix").is_none());
    }
}
