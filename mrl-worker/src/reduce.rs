use anyhow::{Context, Error};
use bytes::Bytes;
use itertools::Itertools;
use tracing::{debug, info};

use common::{AttemptId, Workload};

use crate::core::{decode_record, AttemptContext, TextRecordWriter};

/// Run one reduce attempt.
///
/// `map_attempts` are the committed attempts of every map task; only their
/// spills are read, so output of losing or failed map attempts never reaches
/// a reducer. The part is written even when there is no input.
pub async fn perform_reduce(ctx: &AttemptContext, map_attempts: &[AttemptId]) -> Result<usize, Error> {
    let reduce_index = ctx.attempt.task().index();
    info!(
        attempt = %ctx.attempt,
        maps = map_attempts.len(),
        "starting reduce attempt"
    );

    let mut records = vec![];
    for map_attempt in map_attempts {
        let key = ctx.layout.spill_key(map_attempt, reduce_index);
        if !ctx.store.exists(&key).await? {
            continue;
        }
        let data = ctx.store.get(&key).await?;
        for line in data.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let kv = decode_record(line).with_context(|| format!("corrupt spill `{key}`"))?;
            records.push((kv.key, kv.value));
        }
    }
    debug!(attempt = %ctx.attempt, records = records.len(), "fetched spills");

    let mut writer = TextRecordWriter::new(ctx.part_key());
    reduce_sorted(ctx.workload, records, ctx.aux.clone(), &mut writer)?;
    writer.close(ctx.store.as_ref()).await
}

fn reduce_sorted(
    workload: Workload,
    mut records: Vec<(Bytes, Bytes)>,
    aux: Bytes,
    writer: &mut TextRecordWriter,
) -> Result<(), Error> {
    records.sort_by(|a, b| a.0.cmp(&b.0));

    let groups = records.into_iter().chunk_by(|(key, _)| key.clone());
    for (key, group) in &groups {
        let values = group.map(|(_, value)| value);
        let out = (workload.reduce_fn)(key.clone(), Box::new(values), aux.clone())?;
        writer.write(&key, &out);
    }
    Ok(())
}
