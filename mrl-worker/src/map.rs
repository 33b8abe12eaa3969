use anyhow::{Context, Error};
use bytes::{Bytes, BytesMut};
use tracing::info;

use common::{ihash, KeyValue, Workload};

use crate::core::{encode_record, AttemptContext, TextRecordWriter};

/// Run one map attempt over a single input object.
///
/// Without reducers the map output is the job output and goes to the
/// attempt's part. With reducers it is partitioned with `ihash(key) % n`
/// into spills below the attempt's staging directory; those are hidden
/// names, so the attempt has nothing to move at task commit.
pub async fn perform_map(ctx: &AttemptContext, input_key: &str) -> Result<usize, Error> {
    info!(attempt = %ctx.attempt, input = input_key, "starting map attempt");

    let data = ctx
        .store
        .get(input_key)
        .await
        .with_context(|| format!("failed to read map input `{input_key}`"))?;
    let input = KeyValue::new(Bytes::from(input_key.to_string()), data);

    if ctx.num_reduces == 0 {
        let mut writer = TextRecordWriter::new(ctx.part_key());
        write_direct(ctx.workload, input, ctx.aux.clone(), &mut writer)?;
        return writer.close(ctx.store.as_ref()).await;
    }

    let (spills, records) = partition(ctx.workload, input, ctx.aux.clone(), ctx.num_reduces)?;
    for (reduce_index, spill) in spills.into_iter().enumerate() {
        if spill.is_empty() {
            continue;
        }
        let key = ctx.layout.spill_key(&ctx.attempt, reduce_index as u32);
        ctx.store.put(&key, spill.freeze()).await?;
    }
    Ok(records)
}

fn write_direct(
    workload: Workload,
    input: KeyValue,
    aux: Bytes,
    writer: &mut TextRecordWriter,
) -> Result<(), Error> {
    for kv in (workload.map_fn)(input, aux)? {
        let kv = kv?;
        writer.write(&kv.key, &kv.value);
    }
    Ok(())
}

fn partition(
    workload: Workload,
    input: KeyValue,
    aux: Bytes,
    num_reduces: u32,
) -> Result<(Vec<BytesMut>, usize), Error> {
    let mut spills = vec![BytesMut::new(); num_reduces as usize];
    let mut records = 0;
    for kv in (workload.map_fn)(input, aux)? {
        let kv = kv?;
        let bucket = ihash(&kv.key) % num_reduces;
        encode_record(&kv, &mut spills[bucket as usize]);
        records += 1;
    }
    Ok((spills, records))
}
