//! Performance benchmarks for the engine's hot paths
//! Measures range planning over real files and partial-table merging.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use shardmill::config::MergeRule;
use shardmill::engine::extract::{build_lookup, RangePartial};
use shardmill::engine::planner;
use std::collections::HashMap;
use std::fs::File;
use std::hint::black_box;
use std::io::Write;
use tempfile::TempDir;

fn write_fixture(dir: &TempDir, rows: usize) -> std::path::PathBuf {
    let path = dir.path().join("bench.csv");
    let mut file = File::create(&path).unwrap();
    writeln!(file, "id,slice,value").unwrap();
    for i in 0..rows {
        writeln!(file, "entity{},TS{},{}", i % 1000, i % 5 + 1, i % 97).unwrap();
    }
    path
}

fn make_partials(ranges: u32, keys_per_range: usize) -> Vec<RangePartial> {
    (0..ranges)
        .map(|range| {
            let entries: HashMap<String, Vec<Option<f64>>> = (0..keys_per_range)
                .map(|k| {
                    // Half the keys overlap between consecutive ranges.
                    let key = format!("entity{}", k + (range as usize * keys_per_range / 2));
                    (key, vec![Some(k as f64), Some((k * 2) as f64)])
                })
                .collect();
            RangePartial {
                range,
                records: keys_per_range as u64,
                skipped: 0,
                entries,
            }
        })
        .collect()
}

fn bench_range_planning(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, 100_000);
    let file_length = std::fs::metadata(&path).unwrap().len();

    let mut group = c.benchmark_group("range_planning");
    for shard_count in [4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(shard_count),
            &shard_count,
            |b, &shard_count| {
                b.iter(|| {
                    let mut handle = File::open(&path).unwrap();
                    let ranges =
                        planner::plan(&mut handle, file_length, shard_count).unwrap();
                    black_box(ranges)
                });
            },
        );
    }
    group.finish();
}

fn bench_lookup_merge(c: &mut Criterion) {
    let rules = [MergeRule::FirstAtSlice(1), MergeRule::Max];

    let mut group = c.benchmark_group("lookup_merge");
    for ranges in [8u32, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(ranges), &ranges, |b, &ranges| {
            b.iter(|| {
                let partials = make_partials(ranges, 2_000);
                black_box(build_lookup(partials, &rules))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_range_planning, bench_lookup_merge);
criterion_main!(benches);
