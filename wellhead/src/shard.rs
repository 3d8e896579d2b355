//! Bounded-size shard output for encoded samples.
//!
//! A [`ShardedWriter`] buffers samples and hands them to a [`ShardSink`] one
//! shard at a time: whenever `part_rows` samples have accumulated, and once
//! more for the remainder when the stream is flushed or committed.
//!
//! ## Parquet layout
//!
//! [`ParquetShardSink`] writes one file per shard into its output directory:
//!
//! ```text
//! <dir>/
//!   <stream>_00000.parquet        — one row per sample
//!   <stream>_00001.parquet
//!   ...
//!   <stream>.manifest.json        — ShardManifest, written on commit
//! ```
//!
//! Each row carries three variable-length list columns: `label`
//! (`List<Float32>`, one entry per input row), `feat_vals` (`List<Float32>`)
//! and `feat_ids` (`List<Int32>`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float32Builder, Int32Builder, ListBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::common::{EncodedSample, FeatureId, write_json_atomic};

pub const LABEL_FIELD: &str = "label";
pub const WEIGHTS_FIELD: &str = "feat_vals";
pub const IDS_FIELD: &str = "feat_ids";

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("no schema declared before writing")]
    SchemaNotDeclared,

    #[error("schema already declared")]
    SchemaAlreadyDeclared,

    #[error("unsupported schema field '{0}'")]
    UnsupportedField(String),

    #[error("field '{field}' must be {expected:?}")]
    FieldType { field: String, expected: ElementType },

    #[error("stream has already been committed")]
    AlreadyCommitted,

    #[error("raw feature id '{0}' is not an int32")]
    NonNumericRawId(String),

    #[error("feature id {0} does not fit in int32")]
    IdOverflow(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Int32,
}

impl ElementType {
    fn data_type(self) -> DataType {
        match self {
            ElementType::Float32 => DataType::Float32,
            ElementType::Int32 => DataType::Int32,
        }
    }
}

/// One variable-length column of the sample schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: ElementType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSchema {
    pub fields: Vec<FieldSpec>,
}

impl SampleSchema {
    /// `label` and `feat_vals` as float32, `feat_ids` as int32.
    pub fn standard() -> Self {
        let field = |name: &str, dtype| FieldSpec {
            name: name.to_string(),
            dtype,
        };
        Self {
            fields: vec![
                field(LABEL_FIELD, ElementType::Float32),
                field(WEIGHTS_FIELD, ElementType::Float32),
                field(IDS_FIELD, ElementType::Int32),
            ],
        }
    }

    /// Every field must name a sample column with its fixed element type.
    pub fn validate(&self) -> Result<(), ShardError> {
        for spec in &self.fields {
            let expected = match spec.name.as_str() {
                LABEL_FIELD | WEIGHTS_FIELD => ElementType::Float32,
                IDS_FIELD => ElementType::Int32,
                other => return Err(ShardError::UnsupportedField(other.to_string())),
            };
            if spec.dtype != expected {
                return Err(ShardError::FieldType {
                    field: spec.name.clone(),
                    expected,
                });
            }
        }
        Ok(())
    }

    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|spec| {
                let item = Field::new("item", spec.dtype.data_type(), true);
                Field::new(&spec.name, DataType::List(Arc::new(item)), false)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }
}

fn id_to_i32(id: &FeatureId) -> Result<i32, ShardError> {
    match id {
        FeatureId::Int(v) => i32::try_from(*v).map_err(|_| ShardError::IdOverflow(*v)),
        FeatureId::Raw(raw) => raw
            .trim()
            .parse::<i32>()
            .map_err(|_| ShardError::NonNumericRawId(raw.clone())),
    }
}

/// Build one record batch (one row per sample) for the declared schema.
pub fn samples_to_record_batch(
    schema: &SampleSchema,
    samples: &[EncodedSample],
) -> Result<RecordBatch, ShardError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields.len());
    for spec in &schema.fields {
        let column: ArrayRef = match spec.name.as_str() {
            IDS_FIELD => {
                let mut builder = ListBuilder::new(Int32Builder::new());
                for sample in samples {
                    for id in &sample.feature_ids {
                        builder.values().append_value(id_to_i32(id)?);
                    }
                    builder.append(true);
                }
                Arc::new(builder.finish())
            }
            LABEL_FIELD | WEIGHTS_FIELD => {
                let mut builder = ListBuilder::new(Float32Builder::new());
                for sample in samples {
                    let values = if spec.name == LABEL_FIELD {
                        &sample.labels
                    } else {
                        &sample.feature_weights
                    };
                    builder.values().append_slice(values);
                    builder.append(true);
                }
                Arc::new(builder.finish())
            }
            other => return Err(ShardError::UnsupportedField(other.to_string())),
        };
        columns.push(column);
    }
    Ok(RecordBatch::try_new(schema.to_arrow(), columns)?)
}

// ============================================================================
// Sink Trait
// ============================================================================

/// Destination of flushed shards.
pub trait ShardSink {
    /// Declare the schema every subsequent shard follows.
    fn declare_schema(&mut self, schema: &SampleSchema, description: &str) -> Result<(), ShardError>;

    /// Persist one complete shard. `index` counts shards within this stream.
    fn write_shard(&mut self, index: usize, samples: &[EncodedSample]) -> Result<(), ShardError>;

    /// Finalize every shard written so far.
    fn commit(&mut self) -> Result<(), ShardError>;
}

// ============================================================================
// Parquet Sink
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub file: String,
    pub num_samples: usize,
}

/// Written by [`ParquetShardSink::commit`]; lists every shard of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub stream: String,
    pub description: String,
    pub schema: SampleSchema,
    pub shards: Vec<ShardEntry>,
    pub total_samples: usize,
}

impl ShardManifest {
    pub fn file_name(stream: &str) -> String {
        format!("{stream}.manifest.json")
    }
}

/// Writes each shard as its own Parquet file.
///
/// Files are written to a temp path in the output directory and renamed once
/// closed, so a shard file is either complete or absent.
pub struct ParquetShardSink {
    dir: PathBuf,
    stream: String,
    schema: Option<(SampleSchema, String)>,
    props: WriterProperties,
    shards: Vec<ShardEntry>,
}

impl ParquetShardSink {
    pub fn create(dir: &Path, stream: &str) -> Result<Self, ShardError> {
        std::fs::create_dir_all(dir)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        Ok(Self {
            dir: dir.to_path_buf(),
            stream: stream.to_string(),
            schema: None,
            props,
            shards: Vec::new(),
        })
    }

    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{index:05}.parquet", self.stream))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(ShardManifest::file_name(&self.stream))
    }
}

impl ShardSink for ParquetShardSink {
    fn declare_schema(&mut self, schema: &SampleSchema, description: &str) -> Result<(), ShardError> {
        if self.schema.is_some() {
            return Err(ShardError::SchemaAlreadyDeclared);
        }
        schema.validate()?;
        self.schema = Some((schema.clone(), description.to_string()));
        Ok(())
    }

    fn write_shard(&mut self, index: usize, samples: &[EncodedSample]) -> Result<(), ShardError> {
        let (schema, _) = self.schema.as_ref().ok_or(ShardError::SchemaNotDeclared)?;
        let batch = samples_to_record_batch(schema, samples)?;

        let path = self.shard_path(index);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer =
                ArrowWriter::try_new(tmp.as_file_mut(), batch.schema(), Some(self.props.clone()))?;
            writer.write(&batch)?;
            writer.close()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| ShardError::Io(e.error))?;

        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("  Wrote shard {} ({} samples)", file, samples.len());
        self.shards.push(ShardEntry {
            file,
            num_samples: samples.len(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ShardError> {
        let (schema, description) = self.schema.clone().ok_or(ShardError::SchemaNotDeclared)?;
        let manifest = ShardManifest {
            stream: self.stream.clone(),
            description,
            schema,
            total_samples: self.shards.iter().map(|s| s.num_samples).sum(),
            shards: self.shards.clone(),
        };
        write_json_atomic(&self.manifest_path(), &manifest)?;
        info!(
            "  Committed {}: {} shards, {} samples",
            self.stream,
            manifest.shards.len(),
            manifest.total_samples
        );
        Ok(())
    }
}

// ============================================================================
// Sharded Writer
// ============================================================================

/// Buffers samples for one output stream and rolls shards at `part_rows`.
pub struct ShardedWriter<S: ShardSink> {
    sink: S,
    part_rows: usize,
    pending: Vec<EncodedSample>,
    schema_declared: bool,
    committed: bool,
    shards_written: usize,
    samples_written: usize,
}

impl<S: ShardSink> ShardedWriter<S> {
    /// `part_rows` is clamped to at least 1.
    pub fn new(sink: S, part_rows: usize) -> Self {
        let part_rows = part_rows.max(1);
        Self {
            sink,
            part_rows,
            pending: Vec::new(),
            schema_declared: false,
            committed: false,
            shards_written: 0,
            samples_written: 0,
        }
    }

    pub fn declare_schema(&mut self, schema: &SampleSchema, description: &str) -> Result<(), ShardError> {
        if self.committed {
            return Err(ShardError::AlreadyCommitted);
        }
        if self.schema_declared {
            return Err(ShardError::SchemaAlreadyDeclared);
        }
        self.sink.declare_schema(schema, description)?;
        self.schema_declared = true;
        Ok(())
    }

    /// Queue one sample, writing a full shard once `part_rows` are queued.
    pub fn push(&mut self, sample: EncodedSample) -> Result<(), ShardError> {
        self.check_writable()?;
        self.pending.push(sample);
        if self.pending.len() >= self.part_rows {
            self.write_pending()?;
        }
        Ok(())
    }

    /// Queue a batch of samples; see [`push`](Self::push).
    pub fn write_batch(&mut self, samples: impl IntoIterator<Item = EncodedSample>) -> Result<(), ShardError> {
        for sample in samples {
            self.push(sample)?;
        }
        Ok(())
    }

    /// Write any queued samples as a (possibly short) shard.
    pub fn flush(&mut self) -> Result<(), ShardError> {
        self.check_writable()?;
        if !self.pending.is_empty() {
            self.write_pending()?;
        }
        Ok(())
    }

    /// Flush the remainder and finalize the stream. Further writes fail.
    pub fn commit(&mut self) -> Result<(), ShardError> {
        self.flush()?;
        self.sink.commit()?;
        self.committed = true;
        Ok(())
    }

    pub fn shards_written(&self) -> usize {
        self.shards_written
    }

    pub fn samples_written(&self) -> usize {
        self.samples_written
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn check_writable(&self) -> Result<(), ShardError> {
        if self.committed {
            return Err(ShardError::AlreadyCommitted);
        }
        if !self.schema_declared {
            return Err(ShardError::SchemaNotDeclared);
        }
        Ok(())
    }

    fn write_pending(&mut self) -> Result<(), ShardError> {
        self.sink.write_shard(self.shards_written, &self.pending)?;
        self.shards_written += 1;
        self.samples_written += self.pending.len();
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{AsArray, Int32Array};
    use arrow::datatypes::{Float32Type, Int32Type};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    /// Records shard sizes instead of writing files.
    #[derive(Default)]
    struct MemorySink {
        shard_sizes: Vec<usize>,
        committed: bool,
    }

    impl ShardSink for MemorySink {
        fn declare_schema(&mut self, schema: &SampleSchema, _: &str) -> Result<(), ShardError> {
            schema.validate()
        }

        fn write_shard(&mut self, index: usize, samples: &[EncodedSample]) -> Result<(), ShardError> {
            assert_eq!(index, self.shard_sizes.len());
            self.shard_sizes.push(samples.len());
            Ok(())
        }

        fn commit(&mut self) -> Result<(), ShardError> {
            self.committed = true;
            Ok(())
        }
    }

    fn sample(tag: u32) -> EncodedSample {
        EncodedSample {
            feature_ids: vec![FeatureId::Int(tag), FeatureId::Raw("17".to_string())],
            feature_weights: vec![0.5, 1.0],
            labels: vec![tag as f32],
        }
    }

    #[test]
    fn rolls_shards_at_part_rows() {
        let mut writer = ShardedWriter::new(MemorySink::default(), 2);
        writer.declare_schema(&SampleSchema::standard(), "test").unwrap();
        writer.write_batch((0..5).map(sample)).unwrap();
        // Two full shards flushed mid-stream, one sample still queued.
        assert_eq!(writer.sink().shard_sizes, vec![2, 2]);
        assert_eq!(writer.pending_len(), 1);

        writer.commit().unwrap();
        assert_eq!(writer.sink().shard_sizes, vec![2, 2, 1]);
        assert!(writer.sink().committed);
        assert_eq!(writer.samples_written(), 5);
        assert_eq!(writer.shards_written(), 3);
    }

    #[test]
    fn empty_remainder_writes_no_shard() {
        let mut writer = ShardedWriter::new(MemorySink::default(), 2);
        writer.declare_schema(&SampleSchema::standard(), "test").unwrap();
        writer.write_batch((0..4).map(sample)).unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.sink().shard_sizes, vec![2, 2]);
    }

    #[test]
    fn writes_require_schema_and_stop_after_commit() {
        let mut writer = ShardedWriter::new(MemorySink::default(), 2);
        assert!(matches!(writer.push(sample(0)), Err(ShardError::SchemaNotDeclared)));
        writer.declare_schema(&SampleSchema::standard(), "test").unwrap();
        assert!(matches!(
            writer.declare_schema(&SampleSchema::standard(), "again"),
            Err(ShardError::SchemaAlreadyDeclared)
        ));
        writer.commit().unwrap();
        assert!(matches!(writer.push(sample(1)), Err(ShardError::AlreadyCommitted)));
    }

    #[test]
    fn unknown_schema_fields_are_rejected() {
        let mut schema = SampleSchema::standard();
        schema.fields.push(FieldSpec {
            name: "extra".to_string(),
            dtype: ElementType::Float32,
        });
        assert!(matches!(schema.validate(), Err(ShardError::UnsupportedField(_))));

        let mut schema = SampleSchema::standard();
        schema.fields[2].dtype = ElementType::Float32;
        assert!(matches!(schema.validate(), Err(ShardError::FieldType { .. })));
    }

    #[test]
    fn raw_ids_must_be_numeric() {
        let mut bad = sample(0);
        bad.feature_ids[1] = FeatureId::Raw("abc".to_string());
        assert!(matches!(
            samples_to_record_batch(&SampleSchema::standard(), &[bad]),
            Err(ShardError::NonNumericRawId(_))
        ));
        let mut big = sample(0);
        big.feature_ids[0] = FeatureId::Int(u32::MAX);
        assert!(matches!(
            samples_to_record_batch(&SampleSchema::standard(), &[big]),
            Err(ShardError::IdOverflow(_))
        ));
    }

    #[test]
    fn parquet_sink_writes_shards_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetShardSink::create(dir.path(), "train_input_part").unwrap();
        let mut writer = ShardedWriter::new(sink, 2);
        writer.declare_schema(&SampleSchema::standard(), "mt_TRAIN").unwrap();
        writer.write_batch((0..3).map(sample)).unwrap();
        writer.commit().unwrap();

        let manifest_path = writer.sink().manifest_path();
        let manifest: ShardManifest =
            serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.description, "mt_TRAIN");
        assert_eq!(manifest.total_samples, 3);
        let sizes: Vec<usize> = manifest.shards.iter().map(|s| s.num_samples).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(manifest.shards[0].file, "train_input_part_00000.parquet");

        let file = std::fs::File::open(dir.path().join(&manifest.shards[1].file)).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file).unwrap().build().unwrap();
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 1);

        let ids = batch.column_by_name(IDS_FIELD).unwrap().as_list::<i32>().value(0);
        let ids: &Int32Array = ids.as_primitive::<Int32Type>();
        assert_eq!(ids.values().to_vec(), vec![2, 17]);
        let labels = batch.column_by_name(LABEL_FIELD).unwrap().as_list::<i32>().value(0);
        assert_eq!(labels.as_primitive::<Float32Type>().values().to_vec(), vec![2.0]);
    }

    #[test]
    fn failed_shard_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetShardSink::create(dir.path(), "s").unwrap();
        let mut writer = ShardedWriter::new(sink, 1);
        writer.declare_schema(&SampleSchema::standard(), "d").unwrap();
        let mut bad = sample(0);
        bad.feature_ids[1] = FeatureId::Raw("x".to_string());
        assert!(writer.push(bad).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
