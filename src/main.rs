use anyhow::Context;
use clap::{Parser, Subcommand};
use shardmill::config::{default_shard_count, default_worker_count, EngineConfig, PipelineSpec};
use shardmill::engine::planner;
use shardmill::{EngineError, Orchestrator};
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, error};

/// Derive per-entity metrics from large delimited time-series files
#[derive(Parser)]
#[command(name = "shardmill")]
#[command(about = "Two-pass sharded map-reduce over delimited time-series files", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both passes and write the merged output file
    Run {
        /// Input delimited file with a header row
        #[arg(short, long)]
        input: PathBuf,

        /// Path of the merged output file (overwritten if present)
        #[arg(short, long)]
        output: PathBuf,

        /// YAML pipeline spec: key columns, reductions, derived columns
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Number of byte ranges to split the input into
        /// (default: 4x workers)
        #[arg(long)]
        shards: Option<usize>,

        /// Maximum concurrently running range workers
        /// (default: available parallelism)
        #[arg(long)]
        workers: Option<usize>,

        /// Directory for intermediate shard files
        #[arg(long)]
        temp_dir: Option<PathBuf>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,

        /// Disable progress bars
        #[arg(long)]
        no_progress: bool,
    },
    /// Print the planned byte ranges for a file without running anything
    Plan {
        /// Input delimited file
        #[arg(short, long)]
        input: PathBuf,

        /// Number of byte ranges to plan (default: 4x available parallelism)
        #[arg(long)]
        shards: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("shardmill started with verbosity level: {}", cli.verbose);

    let result = match cli.command {
        Commands::Run {
            input,
            output,
            pipeline,
            shards,
            workers,
            temp_dir,
            json,
            no_progress,
        } => {
            run_pipeline(
                input,
                output,
                pipeline,
                shards,
                workers,
                temp_dir,
                json,
                no_progress,
            )
            .await
        }
        Commands::Plan { input, shards } => plan_ranges(input, shards),
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        match e.downcast_ref::<EngineError>() {
            Some(engine_error) => {
                eprintln!("{} error: {engine_error}", engine_error.category());
                std::process::exit(engine_error.exit_code());
            }
            None => {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    input: PathBuf,
    output: PathBuf,
    pipeline: PathBuf,
    shards: Option<usize>,
    workers: Option<usize>,
    temp_dir: Option<PathBuf>,
    json: bool,
    no_progress: bool,
) -> anyhow::Result<()> {
    let spec = PipelineSpec::from_yaml_file(&pipeline)?;
    let worker_count = workers.unwrap_or_else(default_worker_count);
    let config = EngineConfig {
        shard_count: shards.unwrap_or_else(|| default_shard_count(worker_count)),
        worker_count,
        temp_dir,
        show_progress: !no_progress,
    };

    let orchestrator = Orchestrator::new(config, spec);
    let summary = orchestrator.run(&input, &output).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Merged {} ranges into {} ({} bytes) in {}ms",
            summary.ranges,
            output.display(),
            summary.output_bytes,
            summary.elapsed_ms
        );
        println!("  output rows:    {}", summary.output_rows);
        println!("  distinct keys:  {}", summary.distinct_keys);
        println!("  skipped:        {}", summary.extract_skipped + summary.join_skipped);
        println!("  orphan rows:    {}", summary.orphan_rows);
    }
    Ok(())
}

fn plan_ranges(input: PathBuf, shards: Option<usize>) -> anyhow::Result<()> {
    let shard_count = shards.unwrap_or_else(|| default_shard_count(default_worker_count()));
    let file_length = std::fs::metadata(&input)
        .with_context(|| format!("reading metadata of {}", input.display()))?
        .len();
    let mut handle =
        File::open(&input).with_context(|| format!("opening {}", input.display()))?;
    let ranges = planner::plan(&mut handle, file_length, shard_count)?;

    println!("{:>6} {:>14} {:>14} {:>14}", "range", "start", "end", "bytes");
    for range in &ranges {
        println!(
            "{:>6} {:>14} {:>14} {:>14}",
            range.index,
            range.start,
            range.end,
            range.len()
        );
    }
    println!("{} ranges over {} bytes", ranges.len(), file_length);
    Ok(())
}
