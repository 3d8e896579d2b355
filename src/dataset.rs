//! Read back a committed shard directory.
//!
//! A [`ShardedDataset`] is opened from the output directory of a pipeline run
//! (the one holding `*.manifest.json` and the Parquet shards). Samples are
//! read lazily, one shard file at a time. An optional [`Vocabulary`] turns
//! feature ids back into their composite keys (`user_id_42`, `OOV_city`, ...).

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use arrow::array::{AsArray, ListArray};
use arrow::datatypes::{Float32Type, Int32Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::errors::ParquetError;
use thiserror::Error;
use tracing::debug;

use wellhead::partition::Split;
use wellhead::shard::{IDS_FIELD, LABEL_FIELD, ShardManifest, WEIGHTS_FIELD};
use wellhead::vocab::{MAPPING_FILE, artifact_path};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("shard is missing list column '{0}'")]
    MissingColumn(&'static str),

    #[error("unknown stream '{0}' (expected train or eval)")]
    UnknownStream(String),

    #[error("sample has {ids} ids, {weights} weights and {labels} labels")]
    ShapeMismatch {
        ids: usize,
        weights: usize,
        labels: usize,
    },
}

fn open_file(path: &Path) -> Result<File, DatasetError> {
    File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve a user-supplied stream name: `train` / `eval`, or the on-disk
/// stream stems.
pub fn parse_split(name: &str) -> Result<Split, DatasetError> {
    match name {
        "train" => Ok(Split::Train),
        "eval" | "test" => Ok(Split::Eval),
        other if other == Split::Train.stream_name() => Ok(Split::Train),
        other if other == Split::Eval.stream_name() => Ok(Split::Eval),
        other => Err(DatasetError::UnknownStream(other.to_string())),
    }
}

// ============================================================================
// Samples
// ============================================================================

/// One sample as stored on disk: `line_per_sample` rows, concatenated.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub feature_ids: Vec<i32>,
    pub feature_weights: Vec<f32>,
    pub labels: Vec<f32>,
}

impl StoredSample {
    pub fn num_rows(&self) -> usize {
        self.labels.len()
    }

    pub fn features_per_row(&self) -> usize {
        match self.labels.len() {
            0 => 0,
            n => self.feature_ids.len() / n,
        }
    }

    /// `(ids, weights, label)` for row `row` of this sample, or `None` past
    /// the last row.
    pub fn row(&self, row: usize) -> Option<(&[i32], &[f32], f32)> {
        let width = self.features_per_row();
        let label = *self.labels.get(row)?;
        let span = row * width..(row + 1) * width;
        Some((
            self.feature_ids.get(span.clone())?,
            self.feature_weights.get(span)?,
            label,
        ))
    }
}

fn list_column<'a>(batch: &'a RecordBatch, name: &'static str) -> Result<&'a ListArray, DatasetError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_list_opt::<i32>())
        .ok_or(DatasetError::MissingColumn(name))
}

fn read_sample(batch: &RecordBatch, row: usize) -> Result<StoredSample, DatasetError> {
    let floats = |name: &'static str| -> Result<Vec<f32>, DatasetError> {
        let values = list_column(batch, name)?.value(row);
        let values = values
            .as_primitive_opt::<Float32Type>()
            .ok_or(DatasetError::MissingColumn(name))?;
        Ok(values.values().to_vec())
    };
    let ids = list_column(batch, IDS_FIELD)?.value(row);
    let ids = ids
        .as_primitive_opt::<Int32Type>()
        .ok_or(DatasetError::MissingColumn(IDS_FIELD))?;
    let sample = StoredSample {
        feature_ids: ids.values().to_vec(),
        feature_weights: floats(WEIGHTS_FIELD)?,
        labels: floats(LABEL_FIELD)?,
    };
    let (ids, weights, labels) = (
        sample.feature_ids.len(),
        sample.feature_weights.len(),
        sample.labels.len(),
    );
    if ids != weights || (labels == 0 && ids != 0) || (labels > 0 && ids % labels != 0) {
        return Err(DatasetError::ShapeMismatch {
            ids,
            weights,
            labels,
        });
    }
    Ok(sample)
}

/// Lazily walks every shard of one stream in manifest order.
pub struct SampleIter {
    dir: PathBuf,
    files: std::vec::IntoIter<String>,
    reader: Option<ParquetRecordBatchReader>,
    batch: Option<RecordBatch>,
    row: usize,
}

impl SampleIter {
    fn open_shard(&self, file: &str) -> Result<ParquetRecordBatchReader, DatasetError> {
        let path = self.dir.join(file);
        debug!("Opening shard {}", path.display());
        Ok(ParquetRecordBatchReaderBuilder::try_new(open_file(&path)?)?.build()?)
    }
}

impl Iterator for SampleIter {
    type Item = Result<StoredSample, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = &self.batch {
                if self.row < batch.num_rows() {
                    let sample = read_sample(batch, self.row);
                    self.row += 1;
                    return Some(sample);
                }
            }
            self.batch = None;

            if let Some(reader) = self.reader.as_mut() {
                match reader.next() {
                    Some(Ok(batch)) => {
                        self.batch = Some(batch);
                        self.row = 0;
                        continue;
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => self.reader = None,
                }
            }

            let file = self.files.next()?;
            match self.open_shard(&file) {
                Ok(reader) => self.reader = Some(reader),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

// ============================================================================
// Vocabulary
// ============================================================================

/// Inverse of the persisted `cat2id.json` mapping.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    keys: HashMap<u32, String>,
}

impl Vocabulary {
    pub fn load(stats_dir: &Path, prefix: &str) -> Result<Self, DatasetError> {
        let path = artifact_path(stats_dir, prefix, MAPPING_FILE);
        let mapping: IndexMap<String, u32> =
            serde_json::from_reader(BufReader::new(open_file(&path)?))?;
        let keys = mapping.into_iter().map(|(key, id)| (id, key)).collect();
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn decode(&self, id: i32) -> Option<&str> {
        let id = u32::try_from(id).ok()?;
        self.keys.get(&id).map(String::as_str)
    }
}

// ============================================================================
// Dataset
// ============================================================================

pub struct ShardedDataset {
    dir: PathBuf,
    train: ShardManifest,
    eval: ShardManifest,
    vocabulary: Option<Vocabulary>,
}

impl ShardedDataset {
    /// Open a committed output directory. Both stream manifests must exist.
    pub fn open(dir: &Path) -> Result<Self, DatasetError> {
        let read_manifest = |split: Split| -> Result<ShardManifest, DatasetError> {
            let path = dir.join(ShardManifest::file_name(split.stream_name()));
            Ok(serde_json::from_reader(BufReader::new(open_file(&path)?))?)
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            train: read_manifest(Split::Train)?,
            eval: read_manifest(Split::Eval)?,
            vocabulary: None,
        })
    }

    /// Attach the id → key mapping written next to the statistics.
    pub fn with_vocabulary(mut self, stats_dir: &Path, prefix: &str) -> Result<Self, DatasetError> {
        self.vocabulary = Some(Vocabulary::load(stats_dir, prefix)?);
        Ok(self)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self, split: Split) -> &ShardManifest {
        match split {
            Split::Train => &self.train,
            Split::Eval => &self.eval,
        }
    }

    pub fn num_samples(&self, split: Split) -> usize {
        self.manifest(split).total_samples
    }

    pub fn vocabulary(&self) -> Option<&Vocabulary> {
        self.vocabulary.as_ref()
    }

    /// Composite key for `id`, if a vocabulary is attached and knows it.
    pub fn decode_id(&self, id: i32) -> Option<&str> {
        self.vocabulary.as_ref()?.decode(id)
    }

    pub fn samples(&self, split: Split) -> SampleIter {
        let files: Vec<String> = self
            .manifest(split)
            .shards
            .iter()
            .map(|s| s.file.clone())
            .collect();
        SampleIter {
            dir: self.dir.clone(),
            files: files.into_iter(),
            reader: None,
            batch: None,
            row: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wellhead::pipeline::{Pipeline, PipelineConfig, PipelinePaths};

    fn run_pipeline(csv: &str, config: PipelineConfig) -> (tempfile::TempDir, PipelinePaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipelinePaths::under(dir.path());
        std::fs::create_dir_all(paths.input.parent().unwrap()).unwrap();
        std::fs::write(&paths.input, csv).unwrap();
        Pipeline::new(config, paths.clone()).unwrap().run().unwrap();
        (dir, paths)
    }

    fn config(lines: usize) -> PipelineConfig {
        PipelineConfig {
            dense_dim: 1,
            slot_dim: 3,
            threshold: 0,
            train_line_count: Some(lines),
            line_per_sample: 1,
            eval_size: 0.0,
            part_rows: 2,
            show_progress: false,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn reads_back_every_sample_across_shards() {
        let csv = "id,label,c2,c3,num\na,1.0,x,y,5\na,0,x,y,10\nb,1.0,x,z,\n";
        let (_dir, paths) = run_pipeline(csv, config(3));
        let dataset = ShardedDataset::open(&paths.output_dir)
            .unwrap()
            .with_vocabulary(&paths.stats_dir, "")
            .unwrap();

        assert_eq!(dataset.num_samples(Split::Train), 3);
        assert_eq!(dataset.manifest(Split::Train).shards.len(), 2);
        assert_eq!(dataset.num_samples(Split::Eval), 0);

        let samples: Vec<StoredSample> = dataset
            .samples(Split::Train)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].feature_weights, vec![0.5, 1.0, 1.0, 1.0]);
        assert_eq!(samples[1].labels, vec![0.0]);

        let (ids, weights, label) = samples[2].row(0).unwrap();
        assert_eq!(label, 1.0);
        assert_eq!(weights[0], 0.0);
        assert_eq!(dataset.decode_id(ids[0]), Some("dense_0"));
        assert_eq!(dataset.decode_id(ids[1]), Some("slot_0_b"));
        assert_eq!(dataset.decode_id(ids[3]), Some("slot_2_z"));
        assert_eq!(dataset.decode_id(-1), None);
        assert!(dataset.samples(Split::Eval).next().is_none());
    }

    #[test]
    fn multi_row_samples_split_into_rows() {
        let mut csv = String::from("id,label,c2,c3,num\n");
        for i in 0..4 {
            csv.push_str(&format!("r{i},{},x,y,{}\n", i % 2, i + 1));
        }
        let (_dir, paths) = run_pipeline(
            &csv,
            PipelineConfig {
                line_per_sample: 2,
                ..config(4)
            },
        );
        let dataset = ShardedDataset::open(&paths.output_dir).unwrap();
        let samples: Vec<StoredSample> = dataset
            .samples(Split::Train)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].num_rows(), 2);
        assert_eq!(samples[1].features_per_row(), 4);
        let (_, weights, label) = samples[1].row(1).unwrap();
        assert_eq!(label, 1.0);
        assert_eq!(weights[0], 1.0);
        assert!(samples[1].row(2).is_none());
        assert!(dataset.decode_id(0).is_none());
    }

    fn batch(ids: Vec<i32>, weights: Vec<f32>, labels: Vec<f32>) -> RecordBatch {
        use arrow::array::ArrayRef;
        use std::sync::Arc;

        let ints = |v: Vec<i32>| -> ArrayRef {
            Arc::new(ListArray::from_iter_primitive::<Int32Type, _, _>([Some(
                v.into_iter().map(Some),
            )]))
        };
        let floats = |v: Vec<f32>| -> ArrayRef {
            Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>([Some(
                v.into_iter().map(Some),
            )]))
        };
        RecordBatch::try_from_iter([
            (LABEL_FIELD, floats(labels)),
            (WEIGHTS_FIELD, floats(weights)),
            (IDS_FIELD, ints(ids)),
        ])
        .unwrap()
    }

    #[test]
    fn ragged_sample_is_rejected() {
        let ok = read_sample(&batch(vec![1, 2, 3, 4], vec![1.0; 4], vec![0.0, 1.0]), 0).unwrap();
        assert_eq!(ok.features_per_row(), 2);
        assert!(ok.row(1).is_some());

        for (ids, weights, labels) in [
            (vec![1, 2, 3], vec![1.0; 2], vec![1.0]),
            (vec![1, 2, 3], vec![1.0; 3], vec![0.0, 1.0]),
            (vec![1], vec![1.0], vec![]),
        ] {
            assert!(matches!(
                read_sample(&batch(ids, weights, labels), 0),
                Err(DatasetError::ShapeMismatch { .. })
            ));
        }
    }

    #[test]
    fn missing_manifest_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ShardedDataset::open(dir.path()),
            Err(DatasetError::Io { .. })
        ));
    }

    #[test]
    fn stream_names_resolve_to_splits() {
        assert_eq!(parse_split("train").unwrap(), Split::Train);
        assert_eq!(parse_split("test_input_part").unwrap(), Split::Eval);
        assert!(matches!(parse_split("dev"), Err(DatasetError::UnknownStream(_))));
    }
}
