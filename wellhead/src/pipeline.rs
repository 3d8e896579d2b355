//! Two-pass driver: statistics, vocabulary, encoding, shard output.
//!
//! ```text
//! StatsPass → Finalize → EncodePass → FlushRemainder → Commit
//! ```
//!
//! 1. **StatsPass** — stream every row once, feed the [`VocabularyBuilder`],
//!    persist the statistics.
//! 2. **Finalize** — reload the persisted statistics, assign ids, persist the
//!    mapping.
//! 3. **EncodePass** — stream the file again, encode each row, group rows into
//!    samples, route samples to train or eval, roll shards per stream.
//! 4. **FlushRemainder** — write whatever is still queued in either stream.
//! 5. **Commit** — finalize both streams and write the malformed-line audit.
//!
//! Blank lines, rows with the wrong field count and rows with unparsable
//! values are recorded by file line number and skipped; every other error
//! aborts the run.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use indicatif::{HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::common::{EncodedSample, FieldLayout, InputLines, RowError, write_json_atomic};
use crate::encoder::FeatureEncoder;
use crate::partition::{DatasetPartitioner, PartitionKey, Split};
use crate::shard::{ParquetShardSink, SampleSchema, ShardError, ShardSink, ShardedWriter};
use crate::vocab::{MinTracking, VocabError, VocabularyBuilder, VocabularyStore};

pub const MALFORMED_LINES_FILE: &str = "malformed_lines.json";

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing required configuration: {0}")]
    MissingRequiredConfig(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot enter {to:?} from {from:?}")]
    InvalidTransition {
        from: PipelineStage,
        to: PipelineStage,
    },

    #[error("vocabulary error: {0}")]
    Vocab(#[from] VocabError),

    #[error("shard error: {0}")]
    Shard(#[from] ShardError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Configuration
// ============================================================================

/// Options recognized by the pipeline. Deserializable from JSON; every field
/// falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of numeric fields.
    pub dense_dim: usize,
    /// Number of categorical fields, including the row id column.
    pub slot_dim: usize,
    /// Emit raw category strings instead of mapped ids for known values.
    pub skip_id_convert: bool,
    /// Categories need strictly more occurrences than this to get an id.
    pub threshold: u64,
    /// Number of data lines in the input; sizes the partitioner. Required.
    pub train_line_count: Option<usize>,
    /// Rows grouped into one sample.
    pub line_per_sample: usize,
    /// Fraction of indices routed to eval.
    pub eval_size: f64,
    /// Samples per shard.
    pub part_rows: usize,
    /// Seed for the train/eval shuffle.
    pub seed: u64,
    /// Filename prefix for the vocabulary artifacts.
    pub stats_prefix: String,
    /// Seed numeric minimums from data instead of 0.
    pub numeric_min_from_data: bool,
    /// Index tested against the eval set when a sample closes.
    pub partition_key: PartitionKey,
    /// Log progress every this many lines.
    pub progress_interval: usize,
    /// Draw progress bars on stderr.
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dense_dim: 1,
            slot_dim: 23,
            skip_id_convert: false,
            threshold: 100,
            train_line_count: None,
            line_per_sample: 1000,
            eval_size: 0.2,
            part_rows: 2_000_000,
            seed: 1024,
            stats_prefix: String::new(),
            numeric_min_from_data: false,
            partition_key: PartitionKey::RowIndex,
            progress_interval: 1_000_000,
            show_progress: true,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file; absent keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Reject configurations that cannot run, before any pass starts.
    pub fn validate(&self) -> Result<usize, PipelineError> {
        let train_line_count = self
            .train_line_count
            .ok_or(PipelineError::MissingRequiredConfig("train_line_count"))?;
        if self.slot_dim == 0 {
            return Err(PipelineError::InvalidConfig(
                "slot_dim must be at least 1: column 0 is the first categorical field"
                    .to_string(),
            ));
        }
        if self.line_per_sample == 0 {
            return Err(PipelineError::InvalidConfig(
                "line_per_sample must be positive".to_string(),
            ));
        }
        if self.part_rows == 0 {
            return Err(PipelineError::InvalidConfig(
                "part_rows must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.eval_size) {
            return Err(PipelineError::InvalidConfig(format!(
                "eval_size {} is outside [0, 1]",
                self.eval_size
            )));
        }
        Ok(train_line_count)
    }

    pub fn layout(&self) -> FieldLayout {
        FieldLayout::new(self.dense_dim, self.slot_dim)
    }

    fn min_tracking(&self) -> MinTracking {
        if self.numeric_min_from_data {
            MinTracking::FromData
        } else {
            MinTracking::ZeroSeeded
        }
    }
}

/// Where the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePaths {
    /// Header-prefixed CSV input.
    pub input: PathBuf,
    /// Directory for the vocabulary artifacts.
    pub stats_dir: PathBuf,
    /// Directory for shards, manifests and the malformed-line audit.
    pub output_dir: PathBuf,
}

impl PipelinePaths {
    /// Conventional layout under one data directory:
    /// `data/train.csv`, `stats_dict/`, `shards/`.
    pub fn under(data_dir: &Path) -> Self {
        Self {
            input: data_dir.join("data").join("train.csv"),
            stats_dir: data_dir.join("stats_dict"),
            output_dir: data_dir.join("shards"),
        }
    }
}

// ============================================================================
// Stages and Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    StatsPass,
    Finalize,
    EncodePass,
    FlushRemainder,
    Commit,
}

impl PipelineStage {
    pub fn next(self) -> Option<Self> {
        match self {
            PipelineStage::StatsPass => Some(PipelineStage::Finalize),
            PipelineStage::Finalize => Some(PipelineStage::EncodePass),
            PipelineStage::EncodePass => Some(PipelineStage::FlushRemainder),
            PipelineStage::FlushRemainder => Some(PipelineStage::Commit),
            PipelineStage::Commit => None,
        }
    }
}

/// A skipped input line. `line` is the 1-based line number in the file,
/// counting the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedLine {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub samples: usize,
    pub shards: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub stats_lines: usize,
    pub encode_lines: usize,
    pub stats_malformed: Vec<MalformedLine>,
    pub encode_malformed: Vec<MalformedLine>,
    /// Total ids assigned (numeric slots + OOV ids + retained categories).
    pub vocabulary_size: usize,
    pub train: StreamSummary,
    pub eval: StreamSummary,
    /// Valid rows left in an incomplete trailing sample and not written.
    pub dropped_tail_rows: usize,
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    paths: PipelinePaths,
    layout: FieldLayout,
    train_line_count: usize,
    stage: PipelineStage,
}

impl Pipeline {
    /// Validates the configuration; nothing is read or written yet.
    pub fn new(config: PipelineConfig, paths: PipelinePaths) -> Result<Self, PipelineError> {
        let train_line_count = config.validate()?;
        Ok(Self {
            layout: config.layout(),
            config,
            paths,
            train_line_count,
            stage: PipelineStage::StatsPass,
        })
    }

    /// Override the default field names.
    pub fn with_layout(mut self, layout: FieldLayout) -> Result<Self, PipelineError> {
        if layout.dense_dim() != self.config.dense_dim || layout.slot_dim() != self.config.slot_dim {
            return Err(PipelineError::InvalidConfig(format!(
                "layout has {} numeric / {} categorical fields, config declares {} / {}",
                layout.dense_dim(),
                layout.slot_dim(),
                self.config.dense_dim,
                self.config.slot_dim
            )));
        }
        self.layout = layout;
        Ok(self)
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    fn advance(&mut self, to: PipelineStage) -> Result<(), PipelineError> {
        if self.stage.next() != Some(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        info!("Stage {:?} → {:?}", self.stage, to);
        self.stage = to;
        Ok(())
    }

    /// Run every stage in order.
    pub fn run(mut self) -> Result<PipelineReport, PipelineError> {
        let pipeline_start = Instant::now();
        let mut report = PipelineReport::default();

        // ── Stage 1: statistics ──────────────────────────────────────────
        info!("Stats pass over {}", self.paths.input.display());
        let builder = self.stats_pass(&mut report)?;
        builder
            .into_store()
            .persist(&self.paths.stats_dir, &self.config.stats_prefix)?;

        // ── Stage 2: vocabulary ──────────────────────────────────────────
        self.advance(PipelineStage::Finalize)?;
        let store = self.finalize()?;
        report.vocabulary_size = store.mapping()?.len();

        // ── Stage 3: encoding ────────────────────────────────────────────
        self.advance(PipelineStage::EncodePass)?;
        let mut train = self.open_stream(Split::Train)?;
        let mut eval = self.open_stream(Split::Eval)?;
        self.encode_pass(&store, &mut train, &mut eval, &mut report)?;

        // ── Stage 4: remainder ───────────────────────────────────────────
        self.advance(PipelineStage::FlushRemainder)?;
        train.flush()?;
        eval.flush()?;

        // ── Stage 5: commit ──────────────────────────────────────────────
        self.advance(PipelineStage::Commit)?;
        train.commit()?;
        eval.commit()?;
        report.train = StreamSummary {
            samples: train.samples_written(),
            shards: train.shards_written(),
        };
        report.eval = StreamSummary {
            samples: eval.samples_written(),
            shards: eval.shards_written(),
        };
        write_json_atomic(
            &self.paths.output_dir.join(MALFORMED_LINES_FILE),
            &report.encode_malformed,
        )?;

        info!(
            "Malformed lines: {} (stats pass), {} (encode pass)",
            report.stats_malformed.len(),
            report.encode_malformed.len()
        );
        info!(
            "Done in {}: train {} samples / {} shards, eval {} samples / {} shards",
            HumanDuration(pipeline_start.elapsed()),
            HumanCount(report.train.samples as u64),
            report.train.shards,
            HumanCount(report.eval.samples as u64),
            report.eval.shards,
        );
        Ok(report)
    }

    fn open_rows(&self) -> Result<InputLines<BufReader<File>>, PipelineError> {
        Ok(InputLines::open(&self.paths.input)?)
    }

    fn progress_bar(&self, label: &str) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.train_line_count as u64);
        if let Ok(style) = ProgressStyle::with_template(&format!(
            "  {label:<10} {{bar:40.cyan/blue}} {{pos}}/{{len}} lines [{{elapsed_precise}}]"
        )) {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }

    fn log_progress(&self, count: usize) {
        if self.config.progress_interval > 0 && count % self.config.progress_interval == 0 {
            info!("  Handled {} lines", HumanCount(count as u64));
        }
    }

    /// Stage 1: accumulate statistics over every well-formed row.
    pub fn stats_pass(&self, report: &mut PipelineReport) -> Result<VocabularyBuilder, PipelineError> {
        let lines = self.open_rows()?;
        let mut builder =
            VocabularyBuilder::new(self.layout.clone()).with_min_tracking(self.config.min_tracking());
        let pb = self.progress_bar("Stats");
        let mut count = 0usize;

        for input in lines {
            let input = input?;
            count += 1;
            pb.inc(1);
            self.log_progress(count);

            let Some(record) = &input.record else {
                record_malformed(&mut report.stats_malformed, input.line, RowError::EmptyLine);
                continue;
            };
            let row = match self.layout.split_record(record) {
                Ok(row) => row,
                Err(e) => {
                    record_malformed(&mut report.stats_malformed, input.line, e);
                    continue;
                }
            };
            match builder.observe_row(&row.numeric, &row.categorical) {
                Ok(()) => {}
                Err(VocabError::InvalidNumeric { field, value }) => {
                    let e = RowError::InvalidNumeric { field, value };
                    record_malformed(&mut report.stats_malformed, input.line, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        pb.finish_and_clear();
        report.stats_lines = count;
        info!(
            "  Stats pass: {} lines, {} malformed",
            HumanCount(count as u64),
            report.stats_malformed.len()
        );
        Ok(builder)
    }

    /// Stage 2: reload the persisted statistics and assign ids.
    pub fn finalize(&self) -> Result<VocabularyStore, PipelineError> {
        let prefix = &self.config.stats_prefix;
        let mut store = VocabularyStore::load(&self.paths.stats_dir, prefix, self.layout.clone())?
            .with_skip_id_convert(self.config.skip_id_convert);
        store.finalize(self.config.threshold)?;
        let path = store.persist_mapping(&self.paths.stats_dir, prefix)?;
        info!("  Wrote vocabulary mapping to {}", path.display());
        Ok(store)
    }

    fn open_stream(&self, split: Split) -> Result<ShardedWriter<ParquetShardSink>, PipelineError> {
        let sink = ParquetShardSink::create(&self.paths.output_dir, split.stream_name())?;
        let mut writer = ShardedWriter::new(sink, self.config.part_rows);
        writer.declare_schema(&SampleSchema::standard(), split.description())?;
        Ok(writer)
    }

    /// Stage 3: encode rows, close a sample every `line_per_sample` lines and
    /// route it to `train` or `eval`.
    pub fn encode_pass<T: ShardSink, E: ShardSink>(
        &self,
        store: &VocabularyStore,
        train: &mut ShardedWriter<T>,
        eval: &mut ShardedWriter<E>,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        let encoder = FeatureEncoder::new(store)?;
        let partitioner =
            DatasetPartitioner::new(self.train_line_count, self.config.eval_size, self.config.seed)
                .with_key(self.config.partition_key);
        let line_per_sample = self.config.line_per_sample;
        let features_per_row = encoder.features_per_row();
        let new_sample = || EncodedSample::with_capacity(line_per_sample, features_per_row);

        let lines = self.open_rows()?;
        let pb = self.progress_bar("Encoding");
        let mut sample = new_sample();
        let mut samples_emitted = 0usize;
        let mut count = 0usize;

        for (line_index, input) in lines.enumerate() {
            let input = input?;
            count = line_index + 1;
            pb.inc(1);
            self.log_progress(count);

            let Some(record) = &input.record else {
                record_malformed(&mut report.encode_malformed, input.line, RowError::EmptyLine);
                continue;
            };
            let row = match self.layout.split_record(record) {
                Ok(row) => row,
                Err(e) => {
                    record_malformed(&mut report.encode_malformed, input.line, e);
                    continue;
                }
            };
            let label = match row.parse_label() {
                Ok(label) => label,
                Err(e) => {
                    record_malformed(&mut report.encode_malformed, input.line, e);
                    continue;
                }
            };
            match encoder.encode_into(
                &row.numeric,
                &row.categorical,
                &mut sample.feature_ids,
                &mut sample.feature_weights,
            ) {
                Ok(()) => sample.labels.push(label),
                Err(VocabError::InvalidNumeric { field, value }) => {
                    let e = RowError::InvalidNumeric { field, value };
                    record_malformed(&mut report.encode_malformed, input.line, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if count % line_per_sample == 0 {
                let full = std::mem::replace(&mut sample, new_sample());
                match partitioner.route(line_index, samples_emitted) {
                    Split::Train => train.push(full)?,
                    Split::Eval => eval.push(full)?,
                }
                samples_emitted += 1;
            }
        }
        pb.finish_and_clear();

        if !sample.is_empty() {
            warn!(
                "  Dropping {} trailing rows that do not fill a sample of {}",
                sample.num_rows(),
                line_per_sample
            );
            report.dropped_tail_rows = sample.num_rows();
        }
        if count != self.train_line_count {
            warn!(
                "  Input has {} data lines but train_line_count is {}",
                count, self.train_line_count
            );
        }
        report.encode_lines = count;
        info!(
            "  Encode pass: {} lines, {} samples, {} malformed",
            HumanCount(count as u64),
            HumanCount(samples_emitted as u64),
            report.encode_malformed.len()
        );
        Ok(())
    }
}

fn record_malformed(list: &mut Vec<MalformedLine>, line: u64, reason: RowError) {
    warn!("  Skipping line {line}: {reason}");
    list.push(MalformedLine {
        line,
        reason: reason.to_string(),
    });
}
