//! End-to-end pipeline properties over temp-file fixtures
//!
//! These tests exercise the whole engine: planning, both passes, the
//! frozen lookup, shard writing, and the merge.

use shardmill::config::{
    DeriveExpr, DerivedColumn, EngineConfig, MergeRule, PipelineSpec, ReductionSpec,
};
use shardmill::engine::extract::{build_lookup, extract_range, GlobalLookup};
use shardmill::engine::planner;
use shardmill::engine::schema::ResolvedPipeline;
use shardmill::{EngineError, Orchestrator};
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn pipeline_spec() -> PipelineSpec {
    PipelineSpec {
        keys: vec!["id".into()],
        slice: "slice".into(),
        reductions: vec![
            ReductionSpec {
                name: "initial_velocity".into(),
                column: "value".into(),
                rule: MergeRule::FirstAtSlice(1),
            },
            ReductionSpec {
                name: "final_score".into(),
                column: "value".into(),
                rule: MergeRule::Max,
            },
        ],
        derived: vec![
            DerivedColumn {
                name: "Initial_Velocity".into(),
                expr: DeriveExpr::Aggregate("initial_velocity".into()),
            },
            DerivedColumn {
                name: "Final_Score".into(),
                expr: DeriveExpr::Aggregate("final_score".into()),
            },
            DerivedColumn {
                name: "Stickiness_Index".into(),
                expr: DeriveExpr::Retention {
                    aggregate: "initial_velocity".into(),
                    value: "value".into(),
                },
            },
        ],
    }
}

fn config(dir: &TempDir, shard_count: usize) -> EngineConfig {
    EngineConfig {
        shard_count,
        worker_count: 4,
        temp_dir: Some(dir.path().join("tmp")),
        show_progress: false,
    }
}

fn write_fixture(dir: &TempDir, name: &str, rows: &[String]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = File::create(&path).unwrap();
    writeln!(file, "id,slice,value").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    path
}

/// Deterministic multi-entity fixture: every entity gets one record per
/// slice, with values spread so initial and max differ.
fn generated_rows(entities: usize, slices: u32) -> Vec<String> {
    let mut rows = Vec::new();
    for entity in 0..entities {
        for slice in 1..=slices {
            let value = (entity as u32 % 17 + 1) * slice;
            rows.push(format!("entity{entity},TS{slice},{value}"));
        }
    }
    rows
}

fn data_rows(output: &Path) -> Vec<csv::StringRecord> {
    csv::Reader::from_path(output)
        .unwrap()
        .into_records()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[tokio::test]
async fn every_record_appears_exactly_once() {
    let dir = TempDir::new().unwrap();
    let rows = generated_rows(100, 5);
    let input = write_fixture(&dir, "input.csv", &rows);
    let output = dir.path().join("merged.csv");

    let orchestrator = Orchestrator::new(config(&dir, 7), pipeline_spec());
    let summary = orchestrator.run(&input, &output).await.unwrap();

    assert_eq!(summary.output_rows, rows.len() as u64);
    assert_eq!(summary.extract_skipped, 0);
    assert_eq!(summary.orphan_rows, 0);
    assert_eq!(data_rows(&output).len(), rows.len());
}

#[tokio::test]
async fn record_count_preserved_for_every_shard_count() {
    let dir = TempDir::new().unwrap();
    let rows = generated_rows(23, 3);
    let input = write_fixture(&dir, "input.csv", &rows);

    // Covers boundaries landing on and around record starts, including
    // more shards than the small file can fill.
    for shard_count in [1, 2, 3, 5, 8, 13, 64] {
        let output = dir.path().join(format!("merged-{shard_count}.csv"));
        let orchestrator = Orchestrator::new(config(&dir, shard_count), pipeline_spec());
        let summary = orchestrator.run(&input, &output).await.unwrap();
        assert_eq!(
            summary.output_rows,
            rows.len() as u64,
            "shard_count {shard_count} lost or duplicated records"
        );
    }
}

#[tokio::test]
async fn reruns_are_byte_identical() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "input.csv", &generated_rows(40, 4));
    let first = dir.path().join("first.csv");
    let second = dir.path().join("second.csv");

    let orchestrator = Orchestrator::new(config(&dir, 5), pipeline_spec());
    orchestrator.run(&input, &first).await.unwrap();
    orchestrator.run(&input, &second).await.unwrap();

    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[tokio::test]
async fn shard_count_does_not_change_the_output() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "input.csv", &generated_rows(40, 4));
    let four = dir.path().join("four.csv");
    let seven = dir.path().join("seven.csv");

    Orchestrator::new(config(&dir, 4), pipeline_spec())
        .run(&input, &four)
        .await
        .unwrap();
    Orchestrator::new(config(&dir, 7), pipeline_spec())
        .run(&input, &seven)
        .await
        .unwrap();

    // Output order is range-then-local, which is file order for any
    // shard count, and the lookup is shard-order-independent.
    assert_eq!(fs::read(&four).unwrap(), fs::read(&seven).unwrap());
}

#[test]
fn lookup_is_shard_order_independent() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "input.csv", &generated_rows(31, 4));
    let spec = pipeline_spec();
    let header = csv::StringRecord::from(vec!["id", "slice", "value"]);
    let resolved = ResolvedPipeline::resolve(&header, &spec).unwrap();
    let rules: Vec<MergeRule> = spec.reductions.iter().map(|r| r.rule).collect();

    let build = |shard_count: usize| -> GlobalLookup {
        let file_length = fs::metadata(&input).unwrap().len();
        let mut handle = File::open(&input).unwrap();
        let ranges = planner::plan(&mut handle, file_length, shard_count).unwrap();
        let partials = ranges
            .iter()
            .map(|range| extract_range(&input, *range, &resolved).unwrap())
            .collect();
        build_lookup(partials, &rules)
    };

    assert_eq!(build(4), build(7));
}

#[tokio::test]
async fn retention_scenario_three_records() {
    let dir = TempDir::new().unwrap();
    let rows = vec![
        "A,1,10".to_string(),
        "A,2,90".to_string(),
        "B,1,5".to_string(),
    ];
    let input = write_fixture(&dir, "input.csv", &rows);
    let output = dir.path().join("merged.csv");

    let summary = Orchestrator::new(config(&dir, 2), pipeline_spec())
        .run(&input, &output)
        .await
        .unwrap();
    assert_eq!(summary.distinct_keys, 2);

    let rows = data_rows(&output);
    assert_eq!(rows.len(), 3);

    // Lookup: A -> initial 10, B -> initial 5.
    assert_eq!(rows[0].get(3), Some("10"));
    assert_eq!(rows[2].get(3), Some("5"));
    // Max for A is 90.
    assert_eq!(rows[1].get(4), Some("90"));

    // Second A record: value 90 at slice 2, retention 1 - 10/90.
    let retention: f64 = rows[1].get(5).unwrap().parse().unwrap();
    assert!((retention - 0.888_888_888_888_888_9).abs() < 1e-9);
}

#[tokio::test]
async fn orphan_record_emitted_once_with_empty_derived_fields() {
    let dir = TempDir::new().unwrap();
    let rows = vec![
        "A,1,10".to_string(),
        "Z,notaslice,3".to_string(),
        "A,2,20".to_string(),
    ];
    let input = write_fixture(&dir, "input.csv", &rows);
    let output = dir.path().join("merged.csv");

    let summary = Orchestrator::new(config(&dir, 2), pipeline_spec())
        .run(&input, &output)
        .await
        .unwrap();

    // The malformed slice keeps Z out of the lookup, but the row still
    // reaches the output exactly once, with derived fields empty.
    assert_eq!(summary.extract_skipped, 1);
    assert_eq!(summary.orphan_rows, 1);
    assert_eq!(summary.output_rows, 3);

    let rows = data_rows(&output);
    let z: Vec<_> = rows.iter().filter(|r| r.get(0) == Some("Z")).collect();
    assert_eq!(z.len(), 1);
    assert_eq!(z[0].get(3), Some(""));
    assert_eq!(z[0].get(4), Some(""));
    assert_eq!(z[0].get(5), Some(""));
}

#[tokio::test]
async fn duplicate_designated_slice_resolves_to_earliest_record() {
    let dir = TempDir::new().unwrap();
    // Malformed input: two slice-1 records for A. The earliest in the
    // file must win for every shard count.
    let rows = vec![
        "A,1,10".to_string(),
        "B,1,7".to_string(),
        "A,1,99".to_string(),
        "A,2,50".to_string(),
    ];
    let input = write_fixture(&dir, "input.csv", &rows);

    for shard_count in [1, 2, 4, 6] {
        let output = dir.path().join(format!("merged-{shard_count}.csv"));
        Orchestrator::new(config(&dir, shard_count), pipeline_spec())
            .run(&input, &output)
            .await
            .unwrap();
        for row in data_rows(&output) {
            if row.get(0) == Some("A") {
                assert_eq!(
                    row.get(3),
                    Some("10"),
                    "shard_count {shard_count} broke the tie-break"
                );
            }
        }
    }
}

#[tokio::test]
async fn empty_input_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("empty.csv");
    File::create(&input).unwrap();
    let output = dir.path().join("merged.csv");

    let err = Orchestrator::new(config(&dir, 2), pipeline_spec())
        .run(&input, &output)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration { .. }));
    assert!(!output.exists());
}

#[tokio::test]
async fn missing_pipeline_column_fails_before_any_shard_is_written() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(&dir, "input.csv", &generated_rows(5, 2));
    let output = dir.path().join("merged.csv");

    let mut spec = pipeline_spec();
    spec.slice = "NoSuchColumn".into();

    let err = Orchestrator::new(config(&dir, 2), spec)
        .run(&input, &output)
        .await
        .unwrap_err();
    assert_eq!(err.category(), "configuration");
    assert!(!output.exists());
}
