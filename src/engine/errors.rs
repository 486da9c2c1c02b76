//! Structured error types for engine runs
//!
//! Callers get distinct diagnostics for caller mistakes (configuration),
//! I/O failures (with the offending byte range attached), and post-merge
//! integrity violations. Recoverable per-record parse failures never
//! appear here; they are absorbed and counted in the run summary.

use super::RunState;
use std::path::PathBuf;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Main error type for engine runs.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller mistake, detected before any worker is scheduled.
    #[error("invalid configuration for `{field}` = `{value}`: {reason}")]
    InvalidConfiguration {
        field: String,
        value: String,
        reason: String,
    },

    /// Fatal I/O failure; aborts the owning stage.
    #[error("i/o failure while {context}")]
    Io {
        context: String,
        /// Index of the byte range being processed, when one was.
        range: Option<u32>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A single range worker failed; wrapped into a stage abort.
    #[error("range {range} failed")]
    RangeFailed {
        range: u32,
        #[source]
        source: Box<EngineError>,
    },

    /// One or more workers failed and the stage stopped scheduling.
    #[error("{} stage aborted after {} range failure(s)", .stage, .failures.len())]
    StageAborted {
        stage: RunState,
        failures: Vec<EngineError>,
    },

    /// An expected shard file was missing when the merge began.
    #[error("missing output shard for range {} at {}", .range, .path.display())]
    IncompleteShard { range: u32, path: PathBuf },

    /// A worker task panicked or was cancelled by the runtime.
    #[error("worker task aborted during {} stage: {}", .stage, .detail)]
    TaskPanicked { stage: RunState, detail: String },
}

impl EngineError {
    /// Build an I/O error with context and an optional offending range.
    pub fn io(
        context: impl Into<String>,
        range: Option<u32>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        EngineError::Io {
            context: context.into(),
            range,
            source: source.into(),
        }
    }

    /// Coarse category for user-facing diagnostics.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::InvalidConfiguration { .. } => "configuration",
            EngineError::Io { .. } => "io",
            EngineError::IncompleteShard { .. } => "integrity",
            EngineError::RangeFailed { source, .. } => source.category(),
            EngineError::StageAborted { failures, .. } => failures
                .first()
                .map(EngineError::category)
                .unwrap_or("internal"),
            EngineError::TaskPanicked { .. } => "internal",
        }
    }

    /// Process exit code for the category, so scripts can tell failure
    /// classes apart.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            "configuration" => 2,
            "io" => 3,
            "integrity" => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_distinct_exit_codes() {
        let config = EngineError::InvalidConfiguration {
            field: "shard_count".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        };
        let io = EngineError::io(
            "reading data.csv",
            Some(3),
            std::io::Error::new(std::io::ErrorKind::Other, "disk fell over"),
        );
        let shard = EngineError::IncompleteShard {
            range: 2,
            path: PathBuf::from("/tmp/shard-00002.csv"),
        };
        assert_eq!(config.exit_code(), 2);
        assert_eq!(io.exit_code(), 3);
        assert_eq!(shard.exit_code(), 4);
    }

    #[test]
    fn stage_abort_reports_inner_category() {
        let inner = EngineError::io(
            "reading range 1",
            Some(1),
            std::io::Error::new(std::io::ErrorKind::Other, "read failed"),
        );
        let abort = EngineError::StageAborted {
            stage: RunState::Extracting,
            failures: vec![EngineError::RangeFailed {
                range: 1,
                source: Box::new(inner),
            }],
        };
        assert_eq!(abort.category(), "io");
        assert!(abort.to_string().contains("extracting"));
    }
}
