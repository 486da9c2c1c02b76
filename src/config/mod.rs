//! Engine configuration and pipeline specification parsing
//!
//! The engine knobs (`shard_count`, `worker_count`, temp dir) come from the
//! caller; the pipeline spec (key columns, reductions, derived columns) is
//! loaded from a YAML file.

use crate::engine::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Runtime knobs for a single engine run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many byte ranges to split the input into.
    pub shard_count: usize,
    /// Upper bound on concurrently running range workers.
    pub worker_count: usize,
    /// Directory for intermediate shard files. Defaults to the system
    /// temp directory.
    pub temp_dir: Option<PathBuf>,
    /// Render progress bars while the passes run.
    pub show_progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = default_worker_count();
        Self {
            shard_count: default_shard_count(workers),
            worker_count: workers,
            temp_dir: None,
            show_progress: false,
        }
    }
}

impl EngineConfig {
    /// Validate the knobs before any I/O is scheduled.
    pub fn validate(&self) -> EngineResult<()> {
        if self.shard_count < 1 {
            return Err(EngineError::InvalidConfiguration {
                field: "shard_count".to_string(),
                value: self.shard_count.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker_count < 1 {
            return Err(EngineError::InvalidConfiguration {
                field: "worker_count".to_string(),
                value: self.worker_count.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Default worker count is the number of available execution units.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Default shard count oversubscribes workers so per-worker startup cost
/// amortizes while ranges stay small enough to parallelize.
pub fn default_shard_count(worker_count: usize) -> usize {
    worker_count * 4
}

/// What pass 1 computes for each distinct key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Value of the column for the record whose time-slice equals the given
    /// index. Ties (malformed duplicate slices) resolve to the earliest
    /// record in the file.
    FirstAtSlice(u32),
    /// Running maximum of the column across all slices.
    Max,
}

/// One pass-1 reduction: a named aggregate over a value column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReductionSpec {
    /// Name the aggregate is referenced by in derived-column expressions.
    pub name: String,
    /// Source column the value is read from.
    pub column: String,
    /// How values for the same key combine.
    pub rule: MergeRule,
}

/// Expression for one derived output column, evaluated per record in
/// pass 2 against that record's lookup entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeriveExpr {
    /// Copy the named aggregate from the lookup entry.
    Aggregate(String),
    /// `1 - aggregate / value`, the retention ratio between the record's
    /// own value and the looked-up aggregate. Empty when the aggregate is
    /// missing or the record value is zero or unparseable.
    Retention { aggregate: String, value: String },
}

/// One derived output column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedColumn {
    /// Header name of the derived column.
    pub name: String,
    /// How the column is computed.
    pub expr: DeriveExpr,
}

/// Schema-parametric description of what the two passes compute.
///
/// ```yaml
/// keys: [IDLink, Platform]
/// slice: TimeSlice
/// reductions:
///   - name: initial_velocity
///     column: Popularity
///     rule: { first_at_slice: 1 }
///   - name: final_score
///     column: Popularity
///     rule: max
/// derived:
///   - name: Initial_Velocity
///     expr: { aggregate: initial_velocity }
///   - name: Stickiness_Index
///     expr: { retention: { aggregate: initial_velocity, value: Popularity } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Entity key column(s); multiple columns form a composite key.
    pub keys: Vec<String>,
    /// Discrete ordered position column (the time-slice index).
    pub slice: String,
    /// Pass-1 reductions building the lookup table.
    pub reductions: Vec<ReductionSpec>,
    /// Derived columns appended to every output row in pass 2.
    #[serde(default)]
    pub derived: Vec<DerivedColumn>,
}

impl PipelineSpec {
    /// Load a pipeline spec from a YAML file.
    pub fn from_yaml_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::io(format!("reading pipeline spec {}", path.display()), None, e)
        })?;
        let spec: PipelineSpec =
            serde_yaml::from_str(&raw).map_err(|e| EngineError::InvalidConfiguration {
                field: "pipeline".to_string(),
                value: path.display().to_string(),
                reason: e.to_string(),
            })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Validate internal consistency without looking at the input header.
    pub fn validate(&self) -> EngineResult<()> {
        if self.keys.is_empty() {
            return Err(invalid("keys", "", "at least one key column is required"));
        }
        if self.slice.trim().is_empty() {
            return Err(invalid("slice", &self.slice, "slice column name is empty"));
        }
        if self.reductions.is_empty() {
            return Err(invalid("reductions", "", "at least one reduction is required"));
        }

        let mut names = HashSet::new();
        for reduction in &self.reductions {
            if !names.insert(reduction.name.as_str()) {
                return Err(invalid(
                    "reductions",
                    &reduction.name,
                    "duplicate reduction name",
                ));
            }
        }

        for derived in &self.derived {
            let aggregate = match &derived.expr {
                DeriveExpr::Aggregate(name) => name,
                DeriveExpr::Retention { aggregate, .. } => aggregate,
            };
            if !names.contains(aggregate.as_str()) {
                return Err(invalid(
                    "derived",
                    &derived.name,
                    "expression references an unknown reduction",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> EngineError {
    EngineError::InvalidConfiguration {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
