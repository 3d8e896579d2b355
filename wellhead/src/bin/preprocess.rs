//! Preprocessor binary: turns a raw clickthrough CSV into vocabulary artifacts
//! and sharded Parquet training/eval streams.
//!
//! ## Input
//!
//! A header-prefixed CSV, by default `<data-dir>/data/train.csv`. Each row is
//! `id,label,<slot fields...>,<dense fields...>`.
//!
//! ## Output
//!
//! Under `<data-dir>/stats_dict/` (or `--stats-dir`):
//! - `val_min_dict.json`, `val_max_dict.json` — per-field numeric min / max
//! - `cat_count_dict.json`                   — per-field category counts
//! - `cat2id.json`                           — composite key → feature id
//!
//! Under `<data-dir>/shards/` (or `--output-dir`):
//! - `train_input_part_NNNNN.parquet`, `test_input_part_NNNNN.parquet`
//! - `train_input_part.manifest.json`, `test_input_part.manifest.json`
//! - `malformed_lines.json`
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin preprocess -- --data-dir data --train-line-count 45000000
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use wellhead::partition::PartitionKey;
use wellhead::pipeline::{Pipeline, PipelineConfig, PipelinePaths};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Build vocabulary statistics and sharded Parquet samples from a clickthrough CSV")]
struct Args {
    /// Top-level data directory (contains data/train.csv; stats_dict/ and
    /// shards/ are created under it).
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Input CSV. Overrides `<data-dir>/data/train.csv`.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Vocabulary artifact directory. Overrides `<data-dir>/stats_dict`.
    #[arg(long)]
    stats_dir: Option<PathBuf>,

    /// Shard output directory. Overrides `<data-dir>/shards`.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// JSON config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of data lines in the input (required, here or in the config).
    #[arg(long)]
    train_line_count: Option<usize>,

    #[arg(long)]
    dense_dim: Option<usize>,

    #[arg(long)]
    slot_dim: Option<usize>,

    /// Categories need strictly more occurrences than this to get an id.
    #[arg(long)]
    threshold: Option<u64>,

    #[arg(long)]
    line_per_sample: Option<usize>,

    /// Fraction of samples routed to the eval stream.
    #[arg(long)]
    eval_size: Option<f64>,

    /// Samples per shard file.
    #[arg(long)]
    part_rows: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Filename prefix for the vocabulary artifacts.
    #[arg(long)]
    stats_prefix: Option<String>,

    /// Emit raw category values instead of mapped ids.
    #[arg(long, default_value_t = false)]
    skip_id_convert: bool,

    /// Seed numeric minimums from the data instead of 0.
    #[arg(long, default_value_t = false)]
    numeric_min_from_data: bool,

    /// Index tested against the eval set when a sample closes.
    #[arg(long, value_enum)]
    partition_key: Option<PartitionKey>,

    /// Disable progress bars.
    #[arg(long, default_value_t = false)]
    no_progress: bool,
}

fn build_config(args: &Args) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(v) = args.train_line_count {
        config.train_line_count = Some(v);
    }
    if let Some(v) = args.dense_dim {
        config.dense_dim = v;
    }
    if let Some(v) = args.slot_dim {
        config.slot_dim = v;
    }
    if let Some(v) = args.threshold {
        config.threshold = v;
    }
    if let Some(v) = args.line_per_sample {
        config.line_per_sample = v;
    }
    if let Some(v) = args.eval_size {
        config.eval_size = v;
    }
    if let Some(v) = args.part_rows {
        config.part_rows = v;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    if let Some(v) = &args.stats_prefix {
        config.stats_prefix = v.clone();
    }
    if let Some(key) = args.partition_key {
        config.partition_key = key;
    }
    config.skip_id_convert |= args.skip_id_convert;
    config.numeric_min_from_data |= args.numeric_min_from_data;
    if args.no_progress {
        config.show_progress = false;
    }
    Ok(config)
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let defaults = PipelinePaths::under(&args.data_dir);
    let paths = PipelinePaths {
        input: args.input.clone().unwrap_or(defaults.input),
        stats_dir: args.stats_dir.clone().unwrap_or(defaults.stats_dir),
        output_dir: args.output_dir.clone().unwrap_or(defaults.output_dir),
    };

    info!("Input:     {}", paths.input.display());
    info!("Stats dir: {}", paths.stats_dir.display());
    info!("Output:    {}", paths.output_dir.display());
    info!(
        "Fields:    {} dense, {} slot; threshold {}, {} lines/sample, eval {:.2}",
        config.dense_dim, config.slot_dim, config.threshold, config.line_per_sample, config.eval_size
    );

    let report = Pipeline::new(config, paths)?.run()?;
    info!(
        "Vocabulary: {} ids; dropped {} trailing rows",
        report.vocabulary_size, report.dropped_tail_rows
    );
    Ok(())
}
