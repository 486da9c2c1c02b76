//! Pass 1: per-range extraction and global lookup construction
//!
//! Each worker scans its range and folds every record into a small per-key
//! table using the configured reduction rules. Both rules depend only on
//! record content, never on scan order across shards, which is what makes
//! merging the partials valid for any shard count and any worker
//! completion order.

use super::errors::EngineResult;
use super::reader::ChunkReader;
use super::schema::ResolvedPipeline;
use super::ByteRange;
use crate::config::MergeRule;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Aggregate slots for one key, aligned with the pipeline's reduction
/// list.
pub type AggregateSlots = Vec<Option<f64>>;

/// One worker's contribution: a partial per-key table plus scan counters.
#[derive(Debug)]
pub struct RangePartial {
    pub range: u32,
    pub entries: HashMap<String, AggregateSlots>,
    /// Records that contributed to the table.
    pub records: u64,
    /// Records dropped because key or slice extraction failed.
    pub skipped: u64,
}

/// Scan one range and reduce it to a [`RangePartial`].
pub fn extract_range(
    input: &Path,
    range: ByteRange,
    pipeline: &ResolvedPipeline,
) -> EngineResult<RangePartial> {
    let mut reader = ChunkReader::open(input, range)?;
    let mut partial = RangePartial {
        range: range.index,
        entries: HashMap::new(),
        records: 0,
        skipped: 0,
    };

    while let Some(record) = reader.next_record()? {
        let Some(key) = pipeline.key(record) else {
            partial.skipped += 1;
            continue;
        };
        let Some(slice) = pipeline.slice(record) else {
            partial.skipped += 1;
            continue;
        };
        partial.records += 1;

        let slots = partial
            .entries
            .entry(key)
            .or_insert_with(|| vec![None; pipeline.reductions.len()]);
        for (i, reduction) in pipeline.reductions.iter().enumerate() {
            let Some(value) = pipeline.reduction_value(record, i) else {
                continue;
            };
            slots[i] = match reduction.rule {
                // First match in scan order wins; scan order within a
                // range is file order, so the tie-break is deterministic.
                MergeRule::FirstAtSlice(target) if slice == target => {
                    Some(slots[i].unwrap_or(value))
                }
                MergeRule::FirstAtSlice(_) => slots[i],
                MergeRule::Max => Some(slots[i].map_or(value, |max| max.max(value))),
            };
        }
    }

    debug!(
        "range {}: {} records, {} skipped, {} keys",
        partial.range,
        partial.records,
        partial.skipped,
        partial.entries.len()
    );
    Ok(partial)
}

/// The frozen per-key table every pass-2 worker reads.
#[derive(Debug, Default, PartialEq)]
pub struct GlobalLookup {
    entries: HashMap<String, AggregateSlots>,
}

impl GlobalLookup {
    /// Aggregates for a key, or `None` for orphaned keys.
    pub fn get(&self, key: &str) -> Option<&[Option<f64>]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Number of distinct keys seen in pass 1.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merge the partial tables into one global lookup.
///
/// Partials are folded in ascending range order, so the result is
/// independent of which worker finished first: `FirstAtSlice` keeps the
/// entry from the earliest range (composed with the in-range tie-break
/// this means "earliest record in the file"), and `Max` takes the max of
/// maxes.
pub fn build_lookup(mut partials: Vec<RangePartial>, rules: &[MergeRule]) -> GlobalLookup {
    partials.sort_by_key(|p| p.range);

    let mut entries: HashMap<String, AggregateSlots> = HashMap::new();
    for partial in partials {
        for (key, incoming) in partial.entries {
            match entries.entry(key) {
                Entry::Vacant(vacant) => {
                    vacant.insert(incoming);
                }
                Entry::Occupied(mut occupied) => {
                    merge_slots(occupied.get_mut(), &incoming, rules);
                }
            }
        }
    }
    GlobalLookup { entries }
}

fn merge_slots(existing: &mut AggregateSlots, incoming: &[Option<f64>], rules: &[MergeRule]) {
    for (i, rule) in rules.iter().enumerate() {
        existing[i] = match rule {
            MergeRule::FirstAtSlice(_) => existing[i].or(incoming[i]),
            MergeRule::Max => match (existing[i], incoming[i]) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        };
    }
}
