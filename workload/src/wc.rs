//! Word count.

use anyhow::Result;
use bytes::Bytes;

use common::{string_from_bytes, KeyValue, MapOutput};

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let text = string_from_bytes(kv.value)?;
    let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    Ok(Box::new(
        words.into_iter().map(|word| Ok(KeyValue::new(word, "1"))),
    ))
}

pub fn reduce(_key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>, _aux: Bytes) -> Result<Bytes> {
    let mut count = 0u64;
    for value in values {
        count += string_from_bytes(value)?.trim().parse::<u64>()?;
    }
    Ok(Bytes::from(count.to_string()))
}
