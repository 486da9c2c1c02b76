//! Shard concatenation
//!
//! The merged output is a byte-level concatenation of the shard files in
//! range order; nothing is re-parsed. Header placement is the join
//! workers' responsibility (only shard 0 carries one).

use super::errors::{EngineError, EngineResult};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;

/// Concatenate `shards` (range index, shard path) into `output`, in
/// strictly increasing range order. Returns the merged byte count.
///
/// Every expected shard must exist before any byte is written; a missing
/// one means a worker crashed or was never scheduled, and silently
/// skipping it would corrupt the output.
pub fn merge_shards(shards: &[(u32, PathBuf)], output: &Path) -> EngineResult<u64> {
    let mut ordered: Vec<&(u32, PathBuf)> = shards.iter().collect();
    ordered.sort_by_key(|(range, _)| *range);

    for (range, path) in &ordered {
        if !path.is_file() {
            return Err(EngineError::IncompleteShard {
                range: *range,
                path: path.clone(),
            });
        }
    }

    let out = File::create(output).map_err(|e| {
        EngineError::io(format!("creating merged output {}", output.display()), None, e)
    })?;
    let mut writer = BufWriter::new(out);

    let mut total = 0u64;
    for (range, path) in &ordered {
        let mut shard = File::open(path).map_err(|e| {
            EngineError::io(
                format!("opening shard {}", path.display()),
                Some(*range),
                e,
            )
        })?;
        total += io::copy(&mut shard, &mut writer).map_err(|e| {
            EngineError::io(
                format!("appending shard {}", path.display()),
                Some(*range),
                e,
            )
        })?;
    }

    writer
        .into_inner()
        .map_err(|e| EngineError::io("flushing merged output", None, e.into_error()))?;

    info!("merged {} shards into {} ({} bytes)", ordered.len(), output.display(), total);
    Ok(total)
}

/// Delete shard files after a successful merge. Failures here are logged
/// and ignored; stale temp files are not worth failing a finished run.
pub fn remove_shards(shards: &[(u32, PathBuf)]) {
    for (_, path) in shards {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("could not remove shard {}: {}", path.display(), e);
        }
    }
}
