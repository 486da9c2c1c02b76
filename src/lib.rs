//! # Shardmill
//!
//! A local, disk-based map-reduce engine that turns a multi-gigabyte
//! delimited time-series file into derived per-entity metrics without ever
//! holding the full file in memory.
//!
//! The input is split into record-aligned byte ranges. Pass one scans every
//! range in parallel and reduces each one to a small per-key table; the
//! partial tables are merged into a single frozen lookup. Pass two re-scans
//! the same ranges, joins every record against the lookup, and streams one
//! output shard per range. The shards are concatenated byte-for-byte into
//! the merged output.
//!
//! ## Modules
//!
//! - `config` - engine knobs and the YAML pipeline specification
//! - `engine` - range planning, chunk reading, the two passes, shard
//!   merging, and the orchestrator that sequences them
pub mod config;
pub mod engine;

pub use config::{EngineConfig, PipelineSpec};
pub use engine::errors::{EngineError, EngineResult};
pub use engine::orchestrator::{Orchestrator, RunSummary};
