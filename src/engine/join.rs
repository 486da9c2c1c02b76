//! Pass 2: broadcast join and shard writing
//!
//! Each worker re-scans its byte range (pass 1's output is not known until
//! every extraction worker has returned, so the engine re-reads instead of
//! buffering records), joins every record against the frozen lookup, and
//! streams `input fields + derived fields` straight to its shard file.
//! Peak memory stays bounded by the lookup, not the file.

use super::errors::{EngineError, EngineResult};
use super::extract::GlobalLookup;
use super::reader::ChunkReader;
use super::schema::{ResolvedExpr, ResolvedPipeline};
use super::ByteRange;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What one join worker produced.
#[derive(Debug)]
pub struct ShardReport {
    pub range: u32,
    pub path: PathBuf,
    /// Rows written to the shard.
    pub rows: u64,
    /// Records dropped because key extraction failed.
    pub skipped: u64,
    /// Rows whose key had no lookup entry; written with empty derived
    /// fields.
    pub orphans: u64,
}

/// Re-scan one range, join each record against `lookup`, and write the
/// range's shard. Only the range-0 worker writes the header row.
pub fn join_range(
    input: &Path,
    range: ByteRange,
    pipeline: &ResolvedPipeline,
    header: &csv::StringRecord,
    lookup: &GlobalLookup,
    shard_path: &Path,
) -> EngineResult<ShardReport> {
    let mut reader = ChunkReader::open(input, range)?;

    let shard = File::create(shard_path).map_err(|e| {
        EngineError::io(
            format!("creating shard {}", shard_path.display()),
            Some(range.index),
            e,
        )
    })?;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(BufWriter::new(shard));
    let write_error = |e: csv::Error| {
        EngineError::io(
            format!("writing shard {}", shard_path.display()),
            Some(range.index),
            e,
        )
    };

    if range.index == 0 {
        let mut columns = header.clone();
        for derived in &pipeline.derived {
            columns.push_field(&derived.name);
        }
        writer.write_record(&columns).map_err(write_error)?;
    }

    let mut report = ShardReport {
        range: range.index,
        path: shard_path.to_path_buf(),
        rows: 0,
        skipped: 0,
        orphans: 0,
    };

    while let Some(record) = reader.next_record()? {
        let Some(key) = pipeline.key(record) else {
            report.skipped += 1;
            continue;
        };
        let entry = lookup.get(&key);
        if entry.is_none() {
            report.orphans += 1;
        }

        let mut row = record.clone();
        for derived in &pipeline.derived {
            match evaluate(derived.expr, record, entry, pipeline) {
                Some(value) => row.push_field(&value.to_string()),
                None => row.push_field(""),
            }
        }
        writer.write_record(&row).map_err(write_error)?;
        report.rows += 1;
    }

    writer.flush().map_err(|e| {
        EngineError::io(
            format!("flushing shard {}", shard_path.display()),
            Some(range.index),
            e,
        )
    })?;

    debug!(
        "range {}: {} rows, {} skipped, {} orphans",
        report.range, report.rows, report.skipped, report.orphans
    );
    Ok(report)
}

fn evaluate(
    expr: ResolvedExpr,
    record: &csv::StringRecord,
    entry: Option<&[Option<f64>]>,
    pipeline: &ResolvedPipeline,
) -> Option<f64> {
    match expr {
        ResolvedExpr::Aggregate(slot) => entry?.get(slot).copied().flatten(),
        ResolvedExpr::Retention { aggregate, value_index } => {
            let initial = entry?.get(aggregate).copied().flatten()?;
            let current = pipeline.column_value(record, value_index)?;
            if current == 0.0 {
                return None;
            }
            Some(1.0 - initial / current)
        }
    }
}
