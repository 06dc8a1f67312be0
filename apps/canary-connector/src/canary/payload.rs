use crate::telemetry::{TagSample, TagValue};
use serde_json::value::RawValue;
use std::collections::{BTreeMap, BTreeSet};

/// `[timestamp, value, quality]`
type Tvq<'a> = (String, &'a TagValue, u16);

/// Key and punctuation around one TVQ triple: `"name":[` ... `],`
const ENTRY_OVERHEAD: usize = 6;
const FALLBACK_TRIPLE_LEN: usize = 64;

/// Encodes samples as the `tvqs` object of a `storeData` call, grouped by `<dataset>.<tag>` with
/// per-tag read order preserved. The result is reused verbatim for retries.
pub fn encode_tvqs(samples: &[TagSample]) -> Result<Box<RawValue>, serde_json::Error> {
    let mut tvqs: BTreeMap<String, Vec<Tvq<'_>>> = BTreeMap::new();
    for sample in samples {
        tvqs.entry(sample.tvq_name()).or_default().push((
            sample.timestamp_iso8601(),
            &sample.value,
            sample.quality.tvq_code(),
        ));
    }
    serde_json::value::to_raw_value(&tvqs)
}

/// Upper bound of the bytes `sample` adds to an encoded `tvqs` object.
pub fn encoded_len(sample: &TagSample) -> usize {
    let triple: Tvq<'_> = (
        sample.timestamp_iso8601(),
        &sample.value,
        sample.quality.tvq_code(),
    );
    let triple_len = serde_json::to_string(&triple)
        .map(|json| json.len())
        .unwrap_or(FALLBACK_TRIPLE_LEN);
    sample.dataset.len() + sample.tag_id.len() + 3 + triple_len + ENTRY_OVERHEAD
}

pub fn datasets(samples: &[TagSample]) -> Vec<String> {
    samples
        .iter()
        .map(|sample| sample.dataset.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}
