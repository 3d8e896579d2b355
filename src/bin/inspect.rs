//! Inspect a preprocessed shard directory: dump manifests, label balance and
//! decoded sample rows in a human-readable format.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --output-dir data/shards
//! cargo run --release --bin inspect -- --output-dir data/shards --stats-dir data/stats_dict --sample-rows 3
//! ```

use std::path::PathBuf;

use clap::Parser;
use confluence::dataset::{ShardedDataset, StoredSample, parse_split};
use wellhead::partition::Split;

#[derive(Parser, Debug)]
#[command(about = "Inspect a sharded clickthrough dataset")]
struct Args {
    /// Directory holding the shard files and manifests.
    #[arg(long)]
    output_dir: PathBuf,

    /// Directory holding `cat2id.json`; enables decoding ids to keys.
    #[arg(long)]
    stats_dir: Option<PathBuf>,

    /// Filename prefix of the vocabulary artifacts.
    #[arg(long, default_value = "")]
    stats_prefix: String,

    /// Only inspect this stream ("train" or "eval").
    #[arg(long)]
    stream: Option<String>,

    /// Number of samples to dump per stream (0 to skip).
    #[arg(long, default_value_t = 2)]
    sample_count: usize,

    /// Number of rows to dump per sample.
    #[arg(long, default_value_t = 5)]
    sample_rows: usize,

    /// Read every sample to report label balance.
    #[arg(long, default_value_t = false)]
    scan: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut dataset = ShardedDataset::open(&args.output_dir)?;
    if let Some(stats_dir) = &args.stats_dir {
        dataset = dataset.with_vocabulary(stats_dir, &args.stats_prefix)?;
    }
    let splits = match &args.stream {
        Some(name) => vec![parse_split(name)?],
        None => vec![Split::Train, Split::Eval],
    };

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Dataset: {}", args.output_dir.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    for split in [Split::Train, Split::Eval] {
        let manifest = dataset.manifest(split);
        println!(
            "║  {:<18} {:>10} samples in {:>5} shards",
            manifest.stream,
            manifest.total_samples,
            manifest.shards.len()
        );
    }
    match dataset.vocabulary() {
        Some(vocab) => println!("║  Vocabulary:        {:>10} ids", vocab.len()),
        None => println!("║  Vocabulary:        (not loaded)"),
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Streams ──────────────────────────────────────────────────────────
    for split in splits {
        let manifest = dataset.manifest(split);
        println!("┌─ Stream \"{}\" ({})", manifest.stream, manifest.description);
        let columns: Vec<String> = manifest
            .schema
            .fields
            .iter()
            .map(|f| format!("{}: list<{:?}>", f.name, f.dtype))
            .collect();
        println!("│  Schema: {}", columns.join(", "));
        for shard in &manifest.shards {
            println!("│    {:<36} {:>10} samples", shard.file, shard.num_samples);
        }

        if args.sample_count > 0 {
            for (i, sample) in dataset.samples(split).take(args.sample_count).enumerate() {
                println!("│");
                print_sample(&dataset, i, &sample?, args.sample_rows);
            }
        }

        if args.scan {
            let mut rows = 0usize;
            let mut positives = 0usize;
            for sample in dataset.samples(split) {
                let sample = sample?;
                rows += sample.num_rows();
                positives += sample.labels.iter().filter(|&&l| l > 0.0).count();
            }
            let rate = if rows > 0 {
                positives as f64 / rows as f64 * 100.0
            } else {
                0.0
            };
            println!("│");
            println!("│  Rows: {rows}  Positive labels: {positives} ({rate:.2}%)");
        }

        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    Ok(())
}

fn print_sample(dataset: &ShardedDataset, index: usize, sample: &StoredSample, max_rows: usize) {
    let n = sample.num_rows();
    let show = n.min(max_rows);
    println!(
        "│  Sample {index}: {n} rows × {} features (first {show}):",
        sample.features_per_row()
    );
    for row in 0..show {
        let Some((ids, weights, label)) = sample.row(row) else {
            break;
        };
        let cells: Vec<String> = ids
            .iter()
            .zip(weights)
            .map(|(&id, &w)| {
                let name = match dataset.decode_id(id) {
                    Some(key) => key.chars().take(24).collect::<String>(),
                    None => id.to_string(),
                };
                if w == 1.0 {
                    name
                } else {
                    format!("{name}={w:.3}")
                }
            })
            .collect();
        println!("│    [{row:>4}] label={label:.0}  {}", cells.join(" "));
    }
    if n > show {
        println!("│    ... ({} more rows)", n - show);
    }
}
