//! Run orchestration
//!
//! Owns the stage sequence: plan ranges, fan out extraction workers,
//! freeze the lookup, fan out join workers, merge shards. Stages are
//! strictly sequential; pass 2 never starts until every pass-1 worker has
//! returned, because the lookup must be complete and immutable before any
//! join worker reads it.

use super::errors::{EngineError, EngineResult};
use super::extract::{build_lookup, extract_range, RangePartial};
use super::join::{join_range, ShardReport};
use super::merge::{merge_shards, remove_shards};
use super::planner;
use super::progress::ProgressReporter;
use super::schema::ResolvedPipeline;
use super::{ByteRange, RunState};
use crate::config::{EngineConfig, MergeRule, PipelineSpec};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::ProgressBar;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Counters and timings from one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Ranges the input was split into.
    pub ranges: usize,
    /// Records that contributed to the lookup in pass 1.
    pub extracted_records: u64,
    /// Pass-1 records dropped by key/slice parse failures.
    pub extract_skipped: u64,
    /// Distinct keys in the frozen lookup.
    pub distinct_keys: usize,
    /// Data rows in the merged output.
    pub output_rows: u64,
    /// Pass-2 records dropped by key parse failures.
    pub join_skipped: u64,
    /// Output rows whose key had no lookup entry.
    pub orphan_rows: u64,
    /// Size of the merged output in bytes.
    pub output_bytes: u64,
}

/// Sequences the stages of one run and owns the worker fan-out.
pub struct Orchestrator {
    config: EngineConfig,
    pipeline: PipelineSpec,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, pipeline: PipelineSpec) -> Self {
        Self { config, pipeline }
    }

    /// Run the full pipeline: `input` is scanned twice, shards are written
    /// to the temp directory, and the merged output lands at `output`.
    pub async fn run(&self, input: &Path, output: &Path) -> EngineResult<RunSummary> {
        match self.run_inner(input, output).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("run state: -> {} ({})", RunState::Failed, e);
                Err(e)
            }
        }
    }

    async fn run_inner(&self, input: &Path, output: &Path) -> EngineResult<RunSummary> {
        self.config.validate()?;
        self.pipeline.validate()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut state = RunState::Planning;
        info!("run state: {}", state);

        let file_length = std::fs::metadata(input)
            .map_err(|e| EngineError::io(format!("reading metadata of {}", input.display()), None, e))?
            .len();
        let mut handle = File::open(input)
            .map_err(|e| EngineError::io(format!("opening {}", input.display()), None, e))?;
        let ranges = planner::plan(&mut handle, file_length, self.config.shard_count)?;
        drop(handle);
        info!(
            "planned {} ranges over {} bytes of {}",
            ranges.len(),
            file_length,
            input.display()
        );

        let header = read_header(input)?;
        let pipeline = Arc::new(ResolvedPipeline::resolve(&header, &self.pipeline)?);

        let shard_dir = self.create_shard_dir()?;
        let shard_paths: Vec<(u32, PathBuf)> = ranges
            .iter()
            .map(|r| (r.index, shard_path(&shard_dir, r.index)))
            .collect();

        let progress = ProgressReporter::new(self.config.show_progress);
        let input = input.to_path_buf();

        advance(&mut state, RunState::Extracting);
        let partials: Vec<RangePartial> = {
            let input = input.clone();
            let pipeline = pipeline.clone();
            self.run_stage(
                RunState::Extracting,
                &ranges,
                progress.stage_bar("extract", ranges.len() as u64),
                move |range| extract_range(&input, range, &pipeline),
            )
            .await?
        };

        advance(&mut state, RunState::Reducing);
        let extracted_records: u64 = partials.iter().map(|p| p.records).sum();
        let extract_skipped: u64 = partials.iter().map(|p| p.skipped).sum();
        let rules: Vec<MergeRule> = pipeline.reductions.iter().map(|r| r.rule).collect();
        let lookup = Arc::new(build_lookup(partials, &rules));
        info!("lookup frozen with {} keys", lookup.len());

        advance(&mut state, RunState::Joining);
        let reports: Vec<ShardReport> = {
            let input = input.clone();
            let pipeline = pipeline.clone();
            let lookup = lookup.clone();
            let header = header.clone();
            let shard_dir = shard_dir.clone();
            let closure_shard_dir = shard_dir.clone();
            let stage = self.run_stage(
                RunState::Joining,
                &ranges,
                progress.stage_bar("join", ranges.len() as u64),
                move |range| {
                    let path = shard_path(&closure_shard_dir, range.index);
                    join_range(&input, range, &pipeline, &header, &lookup, &path)
                },
            );
            match stage.await {
                Ok(reports) => reports,
                Err(e) => {
                    warn!("shard files retained for inspection in {}", shard_dir.display());
                    return Err(e);
                }
            }
        };

        advance(&mut state, RunState::Merging);
        let output_bytes = match merge_shards(&shard_paths, output) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("shard files retained for inspection in {}", shard_dir.display());
                return Err(e);
            }
        };
        remove_shards(&shard_paths);
        let _ = std::fs::remove_dir(&shard_dir);

        advance(&mut state, RunState::Done);
        Ok(RunSummary {
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            ranges: ranges.len(),
            extracted_records,
            extract_skipped,
            distinct_keys: lookup.len(),
            output_rows: reports.iter().map(|r| r.rows).sum(),
            join_skipped: reports.iter().map(|r| r.skipped).sum(),
            orphan_rows: reports.iter().map(|r| r.orphans).sum(),
            output_bytes,
        })
    }

    /// Fan one stage out over `ranges` with at most `worker_count`
    /// blocking tasks in flight. The first failure stops further
    /// scheduling; in-flight workers finish or fail on their own, and the
    /// stage returns an aggregated error naming every failed range.
    async fn run_stage<T, F>(
        &self,
        stage: RunState,
        ranges: &[ByteRange],
        bar: ProgressBar,
        task: F,
    ) -> EngineResult<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(ByteRange) -> EngineResult<T> + Clone + Send + 'static,
    {
        let mut pending = ranges.iter().copied();
        let mut in_flight = FuturesUnordered::new();
        let mut results = Vec::with_capacity(ranges.len());
        let mut failures: Vec<EngineError> = Vec::new();

        loop {
            while failures.is_empty() && in_flight.len() < self.config.worker_count {
                let Some(range) = pending.next() else { break };
                let task = task.clone();
                in_flight.push(tokio::task::spawn_blocking(move || {
                    (range.index, task(range))
                }));
            }
            match in_flight.next().await {
                Some(Ok((_, Ok(value)))) => {
                    results.push(value);
                    bar.inc(1);
                }
                Some(Ok((index, Err(e)))) => {
                    warn!("range {} failed during {}: {}", index, stage, e);
                    failures.push(EngineError::RangeFailed {
                        range: index,
                        source: Box::new(e),
                    });
                }
                Some(Err(join_error)) => {
                    failures.push(EngineError::TaskPanicked {
                        stage,
                        detail: join_error.to_string(),
                    });
                }
                None => break,
            }
        }
        bar.finish_and_clear();

        if !failures.is_empty() {
            return Err(EngineError::StageAborted { stage, failures });
        }
        Ok(results)
    }

    fn create_shard_dir(&self) -> EngineResult<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("shardmill-");
        let dir = match &self.config.temp_dir {
            Some(base) => {
                std::fs::create_dir_all(base).map_err(|e| {
                    EngineError::io(
                        format!("creating temp directory {}", base.display()),
                        None,
                        e,
                    )
                })?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| EngineError::io("creating shard directory", None, e))?;
        // Persist the directory; failed runs keep their shards for
        // inspection and successful runs clean up explicitly.
        Ok(dir.into_path())
    }
}

fn shard_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("shard-{index:05}.csv"))
}

fn read_header(input: &Path) -> EngineResult<csv::StringRecord> {
    let mut reader = csv::Reader::from_path(input)
        .map_err(|e| EngineError::io(format!("opening {}", input.display()), None, e))?;
    let header = reader
        .headers()
        .map_err(|e| EngineError::io(format!("reading header of {}", input.display()), None, e))?
        .clone();
    Ok(header)
}

fn advance(state: &mut RunState, next: RunState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal transition {state} -> {next}"
    );
    info!("run state: {} -> {}", state, next);
    *state = next;
}
