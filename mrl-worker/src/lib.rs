//! Execution of map and reduce task attempts.
//!
//! An attempt only ever writes below the work directory it is given (its
//! private staging directory unless task commit is disabled) and below its
//! own shuffle directory. Making the output visible is left to the commit
//! coordinator.

pub mod core;
pub mod map;
pub mod reduce;

pub use crate::core::{AttemptContext, TextRecordWriter};
pub use crate::map::perform_map;
pub use crate::reduce::perform_reduce;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use common::{JobId, MemoryStore, ObjectStore, OutputLayout, TaskKind};

    use super::*;

    fn context(store: Arc<MemoryStore>, kind: TaskKind, index: u32, num_reduces: u32) -> AttemptContext {
        let layout = OutputLayout::new("out");
        let attempt = JobId::new("test", 1).task(kind, index).attempt(0);
        AttemptContext {
            work_dir: layout.attempt_staging_dir(&attempt),
            attempt,
            store,
            layout,
            num_reduces,
            workload: workload::try_named("wc").unwrap(),
            aux: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn map_only_attempt_writes_its_part() {
        let store = Arc::new(MemoryStore::new());
        store.put("in/0", Bytes::from("b a b")).await.unwrap();

        let ctx = context(store.clone(), TaskKind::Map, 0, 0);
        assert_eq!(perform_map(&ctx, "in/0").await.unwrap(), 3);

        let part = store.get(&ctx.part_key()).await.unwrap();
        assert_eq!(part, Bytes::from("b\t1\na\t1\nb\t1\n"));
    }

    #[tokio::test]
    async fn map_and_reduce_count_words() {
        let store = Arc::new(MemoryStore::new());
        store.put("in/0", Bytes::from("b a b")).await.unwrap();
        store.put("in/1", Bytes::from("a c")).await.unwrap();

        let maps: Vec<AttemptContext> = (0..2)
            .map(|i| context(store.clone(), TaskKind::Map, i, 1))
            .collect();
        perform_map(&maps[0], "in/0").await.unwrap();
        perform_map(&maps[1], "in/1").await.unwrap();
        // Spills are hidden, nothing lands in the staged part.
        assert!(!store.exists(&maps[0].part_key()).await.unwrap());

        let attempts: Vec<_> = maps.iter().map(|m| m.attempt.clone()).collect();
        let reduce = context(store.clone(), TaskKind::Reduce, 0, 1);
        assert_eq!(perform_reduce(&reduce, &attempts).await.unwrap(), 3);

        let part = store.get(&reduce.part_key()).await.unwrap();
        assert_eq!(part, Bytes::from("a\t2\nb\t2\nc\t1\n"));
    }

    #[tokio::test]
    async fn reducer_without_input_writes_empty_part() {
        let store = Arc::new(MemoryStore::new());
        let reduce = context(store.clone(), TaskKind::Reduce, 0, 1);

        assert_eq!(perform_reduce(&reduce, &[]).await.unwrap(), 0);
        assert_eq!(store.get(&reduce.part_key()).await.unwrap(), Bytes::new());
    }
}
