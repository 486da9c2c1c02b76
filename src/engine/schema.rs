//! Header resolution and per-record field extraction
//!
//! Column names from the pipeline spec are resolved against the input's
//! header row once, before any worker is scheduled; workers then extract
//! keys, slices, and values by index.

use super::errors::{EngineError, EngineResult};
use crate::config::{DeriveExpr, MergeRule, PipelineSpec};

/// Separator between the parts of a composite key. Unprintable, so it
/// cannot collide with delimited field data.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// A reduction with its value column resolved to an index.
#[derive(Debug, Clone)]
pub struct ResolvedReduction {
    pub name: String,
    pub rule: MergeRule,
    pub value_index: usize,
}

/// A derived column with every referenced name resolved.
#[derive(Debug, Clone)]
pub struct ResolvedDerived {
    pub name: String,
    pub expr: ResolvedExpr,
}

/// Index-resolved form of [`DeriveExpr`].
#[derive(Debug, Clone, Copy)]
pub enum ResolvedExpr {
    /// Position of the aggregate in the lookup entry.
    Aggregate(usize),
    /// Aggregate position plus the record column the ratio divides by.
    Retention { aggregate: usize, value_index: usize },
}

/// The pipeline spec bound to one concrete input header.
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    key_indices: Vec<usize>,
    slice_index: usize,
    pub reductions: Vec<ResolvedReduction>,
    pub derived: Vec<ResolvedDerived>,
}

impl ResolvedPipeline {
    /// Bind `spec` to `header`, failing with a configuration error naming
    /// the first column that does not exist.
    pub fn resolve(header: &csv::StringRecord, spec: &PipelineSpec) -> EngineResult<Self> {
        let key_indices = spec
            .keys
            .iter()
            .map(|name| column_index(header, name, "keys"))
            .collect::<EngineResult<Vec<_>>>()?;
        let slice_index = column_index(header, &spec.slice, "slice")?;

        let reductions = spec
            .reductions
            .iter()
            .map(|r| {
                Ok(ResolvedReduction {
                    name: r.name.clone(),
                    rule: r.rule,
                    value_index: column_index(header, &r.column, "reductions")?,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let aggregate_index = |name: &str| {
            reductions
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| EngineError::InvalidConfiguration {
                    field: "derived".to_string(),
                    value: name.to_string(),
                    reason: "expression references an unknown reduction".to_string(),
                })
        };

        let derived = spec
            .derived
            .iter()
            .map(|d| {
                let expr = match &d.expr {
                    DeriveExpr::Aggregate(name) => ResolvedExpr::Aggregate(aggregate_index(name)?),
                    DeriveExpr::Retention { aggregate, value } => ResolvedExpr::Retention {
                        aggregate: aggregate_index(aggregate)?,
                        value_index: column_index(header, value, "derived")?,
                    },
                };
                Ok(ResolvedDerived { name: d.name.clone(), expr })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Self { key_indices, slice_index, reductions, derived })
    }

    /// Composite entity key for a record, or `None` when a key field is
    /// absent.
    pub fn key(&self, record: &csv::StringRecord) -> Option<String> {
        let mut key = String::new();
        for (i, index) in self.key_indices.iter().enumerate() {
            let field = record.get(*index)?;
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(field);
        }
        Some(key)
    }

    /// Time-slice index for a record. An alphabetic prefix (`TS3`) is
    /// stripped before the numeric parse.
    pub fn slice(&self, record: &csv::StringRecord) -> Option<u32> {
        parse_slice(record.get(self.slice_index)?)
    }

    /// Numeric value feeding the given reduction, when present and finite.
    pub fn reduction_value(&self, record: &csv::StringRecord, reduction: usize) -> Option<f64> {
        parse_value(record.get(self.reductions[reduction].value_index)?)
    }

    /// Numeric value of an arbitrary resolved column.
    pub fn column_value(&self, record: &csv::StringRecord, index: usize) -> Option<f64> {
        parse_value(record.get(index)?)
    }
}

fn column_index(header: &csv::StringRecord, name: &str, field: &str) -> EngineResult<usize> {
    header
        .iter()
        .position(|column| column == name)
        .ok_or_else(|| EngineError::InvalidConfiguration {
            field: field.to_string(),
            value: name.to_string(),
            reason: "column not found in input header".to_string(),
        })
}

fn parse_slice(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let digits = trimmed.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
