use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use common::layout::{join, part_name};
use common::{AttemptId, KeyValue, ObjectStore, OutputLayout, Workload};

/// Everything one task attempt needs to run.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub attempt: AttemptId,
    pub store: Arc<dyn ObjectStore>,
    pub layout: OutputLayout,

    /// Where this attempt writes its part: its private staging directory,
    /// or the final output directory when task commit is disabled.
    pub work_dir: String,

    pub num_reduces: u32,
    pub workload: Workload,

    /// Auxiliary arguments to pass to the MapReduce application.
    pub aux: Bytes,
}

impl AttemptContext {
    pub fn part_key(&self) -> String {
        join(&self.work_dir, &part_name(self.attempt.task()))
    }
}

/// Writes `key\tvalue` lines into one part.
///
/// The part is buffered and published in one put on [`close`], so it is
/// created even if no record was written and never observed half-written.
///
/// [`close`]: TextRecordWriter::close
#[derive(Debug)]
pub struct TextRecordWriter {
    key: String,
    buf: BytesMut,
    records: usize,
}

impl TextRecordWriter {
    pub fn new(key: String) -> Self {
        Self {
            key,
            buf: BytesMut::new(),
            records: 0,
        }
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) {
        self.buf.put_slice(key);
        self.buf.put_u8(b'\t');
        self.buf.put_slice(value);
        self.buf.put_u8(b'\n');
        self.records += 1;
    }

    pub async fn close(self, store: &dyn ObjectStore) -> Result<usize> {
        store
            .put(&self.key, self.buf.freeze())
            .await
            .with_context(|| format!("failed to write part `{}`", self.key))?;
        debug!(part = %self.key, records = self.records, "closed part");
        Ok(self.records)
    }
}

/// Encode one intermediate record as a spill line.
pub fn encode_record(kv: &KeyValue, out: &mut BytesMut) {
    out.put_slice(URL_SAFE.encode(&kv.key).as_bytes());
    out.put_u8(b' ');
    out.put_slice(URL_SAFE.encode(&kv.value).as_bytes());
    out.put_u8(b'\n');
}

/// Decode a spill line written by [`encode_record`].
pub fn decode_record(line: &[u8]) -> Result<KeyValue> {
    let line = std::str::from_utf8(line)?;
    let (key, value) = line
        .split_once(' ')
        .ok_or_else(|| anyhow!("malformed spill line `{line}`"))?;
    Ok(KeyValue::new(URL_SAFE.decode(key)?, URL_SAFE.decode(value)?))
}
