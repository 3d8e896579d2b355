//! Common types and constants used throughout the project.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// CSV column holding the click label.
pub const LABEL_COLUMN: usize = 1;

/// Separator between a field name and a category value in composite vocabulary keys.
pub const KEY_SEPARATOR: &str = "_";

/// Prefix of the composite key that names a field's out-of-vocabulary id.
pub const OOV_PREFIX: &str = "OOV_";

/// Upper bound on rows preallocated for one sample.
pub const MAX_RESERVED_ROWS: usize = 4096;

/// Numeric (dense) field names of the Meituan advertising log.
pub const MEITUAN_NUMERIC_FIELDS: [&str; 1] = ["app_score"];

/// Categorical (slot) field names of the Meituan advertising log, in column order.
/// The row id `log_id` is column 0; the rest follow the label column.
pub const MEITUAN_CATEGORICAL_FIELDS: [&str; 23] = [
    "log_id",
    "user_id",
    "age",
    "gender",
    "residence",
    "city",
    "city_rank",
    "series_dev",
    "series_group",
    "emui_dev",
    "device_name",
    "device_size",
    "net_type",
    "task_id",
    "adv_id",
    "creat_type_cd",
    "adv_prim_id",
    "inter_type_cd",
    "slot_id",
    "site_id",
    "spread_app_id",
    "hispace_app_tags",
    "app_second_class",
];

// ============================================================================
// Row Errors
// ============================================================================

/// Problems confined to a single input row. The pipeline records the line and
/// moves on; these never abort a run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RowError {
    #[error("found {found} fields, expected {expected}")]
    FieldCount { expected: usize, found: usize },

    #[error("field '{field}' has non-numeric value '{value}'")]
    InvalidNumeric { field: String, value: String },

    #[error("label '{0}' is not a number")]
    InvalidLabel(String),

    #[error("empty line")]
    EmptyLine,
}

// ============================================================================
// Field Layout
// ============================================================================

/// Maps CSV columns onto the label, numeric fields and categorical fields.
///
/// Column layout for a row of `1 + dense_dim + slot_dim` fields:
///
/// ```text
///   0                      first categorical field (the row id)
///   1                      label
///   2 ..= slot_dim         remaining categorical fields
///   slot_dim + 1 ..        numeric fields (dense_dim of them)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    numeric_fields: Vec<String>,
    categorical_fields: Vec<String>,
}

impl FieldLayout {
    /// Layout with default field names. The Meituan names are used when the
    /// dimensions match that log; otherwise fields are named `dense_<i>` and
    /// `slot_<i>`.
    pub fn new(dense_dim: usize, slot_dim: usize) -> Self {
        if dense_dim == MEITUAN_NUMERIC_FIELDS.len() && slot_dim == MEITUAN_CATEGORICAL_FIELDS.len()
        {
            return Self::with_names(
                MEITUAN_NUMERIC_FIELDS.iter().map(|s| s.to_string()).collect(),
                MEITUAN_CATEGORICAL_FIELDS.iter().map(|s| s.to_string()).collect(),
            );
        }
        Self::with_names(
            (0..dense_dim).map(|i| format!("dense_{i}")).collect(),
            (0..slot_dim).map(|i| format!("slot_{i}")).collect(),
        )
    }

    pub fn with_names(numeric_fields: Vec<String>, categorical_fields: Vec<String>) -> Self {
        Self {
            numeric_fields,
            categorical_fields,
        }
    }

    pub fn dense_dim(&self) -> usize {
        self.numeric_fields.len()
    }

    pub fn slot_dim(&self) -> usize {
        self.categorical_fields.len()
    }

    /// Number of features emitted per row.
    pub fn features_per_row(&self) -> usize {
        self.dense_dim() + self.slot_dim()
    }

    /// Number of CSV fields a well-formed row carries.
    pub fn row_len(&self) -> usize {
        1 + self.dense_dim() + self.slot_dim()
    }

    pub fn numeric_fields(&self) -> &[String] {
        &self.numeric_fields
    }

    pub fn categorical_fields(&self) -> &[String] {
        &self.categorical_fields
    }

    /// Split a CSV record into label, numeric and categorical values.
    pub fn split_record<'a>(&self, record: &'a csv::StringRecord) -> Result<RawRow<'a>, RowError> {
        let fields: Vec<&'a str> = record.iter().collect();
        self.split_fields(&fields)
    }

    /// Split pre-tokenized fields into label, numeric and categorical values.
    pub fn split_fields<'a>(&self, fields: &[&'a str]) -> Result<RawRow<'a>, RowError> {
        if fields.len() != self.row_len() {
            return Err(RowError::FieldCount {
                expected: self.row_len(),
                found: fields.len(),
            });
        }
        let slot_dim = self.slot_dim();
        let mut categorical = Vec::with_capacity(slot_dim);
        if slot_dim > 0 {
            categorical.push(fields[0]);
            categorical.extend_from_slice(&fields[LABEL_COLUMN + 1..=slot_dim]);
        }
        let numeric = fields[slot_dim + 1..].to_vec();
        Ok(RawRow {
            label: fields[LABEL_COLUMN],
            numeric,
            categorical,
        })
    }
}

/// One input row, split by role. Values borrow from the CSV record.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow<'a> {
    pub label: &'a str,
    pub numeric: Vec<&'a str>,
    pub categorical: Vec<&'a str>,
}

impl RawRow<'_> {
    pub fn parse_label(&self) -> Result<f32, RowError> {
        self.label
            .trim()
            .parse::<f32>()
            .map_err(|_| RowError::InvalidLabel(self.label.to_string()))
    }
}

// ============================================================================
// Input Lines
// ============================================================================

/// One physical line of the input file.
#[derive(Debug, Clone, PartialEq)]
pub struct InputLine {
    /// 1-based line number; the header is line 1.
    pub line: u64,
    /// `None` for a blank line.
    pub record: Option<csv::StringRecord>,
}

/// Data lines of a header-prefixed, comma-delimited file, one item per
/// physical line.
///
/// `csv::Reader` drops blank lines without a trace. Here they are yielded
/// with no record, so every line keeps its number and still counts toward
/// sample boundaries.
pub struct InputLines<R> {
    reader: R,
    parser: csv::ReaderBuilder,
    buf: Vec<u8>,
    line: u64,
}

impl InputLines<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, csv::Error> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: BufRead> InputLines<R> {
    /// Consumes the header line.
    pub fn new(mut reader: R) -> Result<Self, csv::Error> {
        let mut buf = Vec::new();
        let line = if reader.read_until(b'\n', &mut buf)? > 0 { 1 } else { 0 };
        let mut parser = csv::ReaderBuilder::new();
        parser
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .buffer_capacity(1024)
            .terminator(csv::Terminator::Any(b'\n'));
        Ok(Self {
            reader,
            parser,
            buf,
            line,
        })
    }
}

impl<R: BufRead> Iterator for InputLines<R> {
    type Item = Result<InputLine, csv::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e.into())),
        }
        self.line += 1;

        let mut content: &[u8] = &self.buf;
        if let Some(rest) = content.strip_suffix(b"\n") {
            content = rest;
        }
        if let Some(rest) = content.strip_suffix(b"\r") {
            content = rest;
        }
        if content.is_empty() {
            return Some(Ok(InputLine {
                line: self.line,
                record: None,
            }));
        }

        let mut record = csv::StringRecord::new();
        let parsed = self.parser.from_reader(content).read_record(&mut record);
        Some(parsed.map(|_| InputLine {
            line: self.line,
            record: Some(record),
        }))
    }
}

// ============================================================================
// Feature Ids and Samples
// ============================================================================

/// A feature id as emitted by the encoder.
///
/// `Raw` carries the category string itself and only appears when id
/// conversion is skipped (synthetic data whose categories already are ids).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeatureId {
    Int(u32),
    Raw(String),
}

impl From<u32> for FeatureId {
    fn from(id: u32) -> Self {
        FeatureId::Int(id)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Int(id) => write!(f, "{id}"),
            FeatureId::Raw(raw) => f.write_str(raw),
        }
    }
}

/// A group of `line_per_sample` consecutive rows, concatenated.
///
/// `feature_ids` and `feature_weights` hold `features_per_row` entries per row
/// in row order; `labels` holds one entry per row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedSample {
    pub feature_ids: Vec<FeatureId>,
    pub feature_weights: Vec<f32>,
    pub labels: Vec<f32>,
}

impl EncodedSample {
    /// Reserves room for `rows` rows, up to [`MAX_RESERVED_ROWS`]; larger
    /// samples grow as rows arrive.
    pub fn with_capacity(rows: usize, features_per_row: usize) -> Self {
        let rows = rows.min(MAX_RESERVED_ROWS);
        let features = rows.saturating_mul(features_per_row);
        Self {
            feature_ids: Vec::with_capacity(features),
            feature_weights: Vec::with_capacity(features),
            labels: Vec::with_capacity(rows),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// ============================================================================
// Artifact IO
// ============================================================================

/// Serialize `value` as JSON into a temp file next to `path`, then rename it
/// over `path`. Readers never observe a partially written file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<()> {
    let staged = stage_json(path, value)?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write `value` as JSON into a temp file in `path`'s directory without
/// renaming it yet. Used to stage several artifacts before committing any.
pub fn stage_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut w, value)?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    Ok(tmp)
}
