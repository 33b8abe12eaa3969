//! Distributed grep: emits every input line containing the pattern given as
//! the auxiliary argument, keyed by line, valued by the input it came from.

use anyhow::Result;
use bytes::Bytes;

use common::{string_from_bytes, KeyValue, MapOutput};

pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    let source = string_from_bytes(kv.key)?;
    let text = string_from_bytes(kv.value)?;
    let pattern = string_from_bytes(aux)?;

    let hits: Vec<String> = text
        .lines()
        .filter(|line| line.contains(pattern.as_str()))
        .map(str::to_string)
        .collect();
    Ok(Box::new(
        hits.into_iter()
            .map(move |line| Ok(KeyValue::new(line, source.clone()))),
    ))
}

/// Lists the sources a line was found in.
pub fn reduce(_key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>, _aux: Bytes) -> Result<Bytes> {
    let sources = values
        .map(string_from_bytes)
        .collect::<Result<Vec<_>>>()?;
    Ok(Bytes::from(sources.join(",")))
}
