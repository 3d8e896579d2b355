//! Vocabulary statistics and feature-id assignment.
//!
//! The statistics pass feeds every row through a [`VocabularyBuilder`], which
//! tracks numeric min/max and per-field category counts. The builder turns into
//! a [`VocabularyStore`], which persists those three maps, reloads them, and
//! derives the final [`VocabularyMapping`] with [`VocabularyStore::finalize`].
//!
//! ## Id layout
//!
//! ```text
//!   0 .. D                numeric field slots (key: "<field>")
//!   D .. D + C            one out-of-vocabulary id per categorical field (key: "OOV_<field>")
//!   D + C ..              retained categories, field order then first-seen order
//!                         (key: "<field>_<value>")
//! ```
//!
//! ## Artifacts
//!
//! Written to a stats directory, each name optionally prefixed for multi-run
//! isolation:
//! - `val_min_dict.json`   — `{field: min}` for numeric fields
//! - `val_max_dict.json`   — `{field: max}` for numeric fields
//! - `cat_count_dict.json` — `{field: {value: count}}` in first-seen order
//! - `cat2id.json`         — finalized `{composite_key: id}` in id order

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use crate::common::{FeatureId, FieldLayout, KEY_SEPARATOR, OOV_PREFIX, stage_json, write_json_atomic};
use crate::encoder::FeatureEncoder;

pub const NUMERIC_MIN_FILE: &str = "val_min_dict.json";
pub const NUMERIC_MAX_FILE: &str = "val_max_dict.json";
pub const CATEGORY_COUNT_FILE: &str = "cat_count_dict.json";
pub const MAPPING_FILE: &str = "cat2id.json";

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum VocabError {
    #[error("expected {expected} {kind} values, got {found}")]
    SchemaMismatch {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("field '{field}' has non-numeric value '{value}'")]
    InvalidNumeric { field: String, value: String },

    #[error("vocabulary has already been finalized")]
    AlreadyFinalized,

    #[error("vocabulary has not been finalized; no ids are assigned yet")]
    UnknownField,

    #[error("{artifact} lists fields {found:?}, layout declares {expected:?}")]
    FieldSetMismatch {
        artifact: &'static str,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("feature id space exhausted")]
    IdSpaceExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse vocabulary artifact: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the numeric minimum is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinTracking {
    /// Start at 0, so the minimum never exceeds 0. Matches the legacy
    /// artifacts bit for bit.
    #[default]
    ZeroSeeded,
    /// Seed both bounds from the first observed value.
    FromData,
}

// ============================================================================
// Field Statistics
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NumericFieldStats {
    pub field_name: String,
    pub min_value: f64,
    pub max_value: f64,
}

impl NumericFieldStats {
    fn new(field_name: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            min_value: 0.0,
            max_value: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoricalFieldStats {
    pub field_name: String,
    /// Occurrence count per category, in first-seen order.
    pub counts: IndexMap<String, u64>,
}

impl CategoricalFieldStats {
    fn new(field_name: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            counts: IndexMap::new(),
        }
    }

    /// Number of categories that would receive an id at `threshold`.
    pub fn retained(&self, threshold: u64) -> usize {
        self.counts.values().filter(|&&c| c > threshold).count()
    }
}

/// Parse a raw numeric cell. Empty cells are missing values, not errors.
pub(crate) fn parse_numeric(field: &str, raw: &str) -> Result<Option<f64>, VocabError> {
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(VocabError::InvalidNumeric {
            field: field.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn check_len(kind: &'static str, expected: usize, found: usize) -> Result<(), VocabError> {
    if expected != found {
        return Err(VocabError::SchemaMismatch {
            kind,
            expected,
            found,
        });
    }
    Ok(())
}

// ============================================================================
// Vocabulary Builder
// ============================================================================

/// In-memory accumulator for the statistics pass.
#[derive(Debug, Clone)]
pub struct VocabularyBuilder {
    layout: FieldLayout,
    min_tracking: MinTracking,
    numeric: Vec<NumericFieldStats>,
    /// Whether each numeric field has seen a value; only consulted for
    /// [`MinTracking::FromData`].
    seen: Vec<bool>,
    categorical: Vec<CategoricalFieldStats>,
}

impl VocabularyBuilder {
    pub fn new(layout: FieldLayout) -> Self {
        let numeric = layout
            .numeric_fields()
            .iter()
            .map(|f| NumericFieldStats::new(f))
            .collect();
        let categorical = layout
            .categorical_fields()
            .iter()
            .map(|f| CategoricalFieldStats::new(f))
            .collect();
        Self {
            seen: vec![false; layout.dense_dim()],
            layout,
            min_tracking: MinTracking::default(),
            numeric,
            categorical,
        }
    }

    pub fn with_min_tracking(mut self, min_tracking: MinTracking) -> Self {
        self.min_tracking = min_tracking;
        self
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    /// Update min/max for each numeric field. Empty values leave their field
    /// untouched. Either every field is updated or none is.
    pub fn observe_numeric(&mut self, values: &[&str]) -> Result<(), VocabError> {
        let parsed = self.parse_numeric_row(values)?;
        self.apply_numeric(&parsed);
        Ok(())
    }

    /// Count each categorical value, including the empty string.
    pub fn observe_categorical(&mut self, values: &[&str]) -> Result<(), VocabError> {
        check_len("categorical", self.categorical.len(), values.len())?;
        self.apply_categorical(values);
        Ok(())
    }

    /// Observe a whole row, validating both halves before touching any state.
    pub fn observe_row(&mut self, numeric: &[&str], categorical: &[&str]) -> Result<(), VocabError> {
        let parsed = self.parse_numeric_row(numeric)?;
        check_len("categorical", self.categorical.len(), categorical.len())?;
        self.apply_numeric(&parsed);
        self.apply_categorical(categorical);
        Ok(())
    }

    fn parse_numeric_row(&self, values: &[&str]) -> Result<Vec<Option<f64>>, VocabError> {
        check_len("numeric", self.numeric.len(), values.len())?;
        self.numeric
            .iter()
            .zip(values)
            .map(|(stats, raw)| parse_numeric(&stats.field_name, raw))
            .collect()
    }

    fn apply_numeric(&mut self, parsed: &[Option<f64>]) {
        for ((stats, seen), value) in self.numeric.iter_mut().zip(&mut self.seen).zip(parsed) {
            let Some(v) = *value else { continue };
            if self.min_tracking == MinTracking::FromData && !*seen {
                stats.min_value = v;
                stats.max_value = v;
            }
            *seen = true;
            if v > stats.max_value {
                stats.max_value = v;
            }
            if v < stats.min_value {
                stats.min_value = v;
            }
        }
    }

    fn apply_categorical(&mut self, values: &[&str]) {
        for (stats, value) in self.categorical.iter_mut().zip(values) {
            // Avoid allocating a key for categories we have already seen.
            match stats.counts.get_mut(*value) {
                Some(count) => *count += 1,
                None => {
                    stats.counts.insert(value.to_string(), 1);
                }
            }
        }
    }

    /// Fold in a builder that observed a later, disjoint range of lines.
    ///
    /// Min/max combine, counts add, and categories first seen in `other` are
    /// appended after this builder's categories, so merging range shards in
    /// line order reproduces a sequential pass.
    pub fn merge(&mut self, other: VocabularyBuilder) -> Result<(), VocabError> {
        if other.layout != self.layout {
            return Err(VocabError::FieldSetMismatch {
                artifact: "merged builder",
                expected: self.layout.categorical_fields().to_vec(),
                found: other.layout.categorical_fields().to_vec(),
            });
        }
        for ((stats, seen), (theirs, their_seen)) in self
            .numeric
            .iter_mut()
            .zip(&mut self.seen)
            .zip(other.numeric.into_iter().zip(other.seen))
        {
            if self.min_tracking == MinTracking::FromData && !*seen {
                stats.min_value = theirs.min_value;
                stats.max_value = theirs.max_value;
            } else if self.min_tracking == MinTracking::ZeroSeeded || their_seen {
                stats.min_value = stats.min_value.min(theirs.min_value);
                stats.max_value = stats.max_value.max(theirs.max_value);
            }
            *seen |= their_seen;
        }
        for (stats, theirs) in self.categorical.iter_mut().zip(other.categorical) {
            for (value, count) in theirs.counts {
                *stats.counts.entry(value).or_insert(0) += count;
            }
        }
        Ok(())
    }

    pub fn numeric_stats(&self) -> &[NumericFieldStats] {
        &self.numeric
    }

    pub fn categorical_stats(&self) -> &[CategoricalFieldStats] {
        &self.categorical
    }

    pub fn into_store(self) -> VocabularyStore {
        VocabularyStore {
            layout: self.layout,
            numeric: self.numeric,
            categorical: self.categorical,
            skip_id_convert: false,
            mapping: None,
        }
    }
}

// ============================================================================
// Vocabulary Mapping
// ============================================================================

/// Finalized composite-key → id assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct VocabularyMapping {
    numeric_fields: Vec<String>,
    categorical_fields: Vec<String>,
    /// Per categorical field: retained category → id.
    entries: Vec<IndexMap<String, u32>>,
    len: u32,
}

impl VocabularyMapping {
    fn build(
        numeric_fields: &[String],
        categorical: &[CategoricalFieldStats],
        threshold: u64,
    ) -> Result<Self, VocabError> {
        let reserved = numeric_fields.len() + categorical.len();
        let mut next = u32::try_from(reserved).map_err(|_| VocabError::IdSpaceExhausted)?;
        let mut entries = Vec::with_capacity(categorical.len());
        for stats in categorical {
            let mut field_ids = IndexMap::with_capacity(stats.retained(threshold));
            for (value, _) in stats.counts.iter().filter(|(_, c)| **c > threshold) {
                field_ids.insert(value.clone(), next);
                next = next.checked_add(1).ok_or(VocabError::IdSpaceExhausted)?;
            }
            debug!(
                "  {}: {} of {} categories retained",
                stats.field_name,
                field_ids.len(),
                stats.counts.len()
            );
            entries.push(field_ids);
        }
        Ok(Self {
            numeric_fields: numeric_fields.to_vec(),
            categorical_fields: categorical.iter().map(|s| s.field_name.clone()).collect(),
            entries,
            len: next,
        })
    }

    /// Total number of ids, i.e. one past the largest id.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of retained category entries (excludes numeric and OOV ids).
    pub fn vocabulary_len(&self) -> usize {
        self.entries.iter().map(IndexMap::len).sum()
    }

    pub fn num_numeric_fields(&self) -> usize {
        self.numeric_fields.len()
    }

    pub fn num_categorical_fields(&self) -> usize {
        self.categorical_fields.len()
    }

    /// Slot id of the numeric field at position `field`.
    pub fn numeric_slot(&self, field: usize) -> u32 {
        field as u32
    }

    /// Out-of-vocabulary id of the categorical field at position `field`.
    pub fn oov_id(&self, field: usize) -> u32 {
        (self.numeric_fields.len() + field) as u32
    }

    /// Id of `value` in the categorical field at position `field`, if retained.
    pub fn lookup(&self, field: usize, value: &str) -> Option<u32> {
        self.entries.get(field)?.get(value).copied()
    }

    /// Resolve a composite key (`<field>`, `OOV_<field>`, or `<field>_<value>`).
    pub fn get(&self, key: &str) -> Option<u32> {
        if let Some(i) = self.numeric_fields.iter().position(|f| f == key) {
            return Some(self.numeric_slot(i));
        }
        if let Some(field) = key.strip_prefix(OOV_PREFIX) {
            if let Some(i) = self.categorical_fields.iter().position(|f| f == field) {
                return Some(self.oov_id(i));
            }
        }
        // Field names may themselves contain the separator, so try every
        // field whose name prefixes the key.
        self.categorical_fields
            .iter()
            .enumerate()
            .filter_map(|(i, field)| {
                let value = key.strip_prefix(field.as_str())?.strip_prefix(KEY_SEPARATOR)?;
                self.lookup(i, value)
            })
            .next()
    }

    /// All composite keys with their ids, in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (String, u32)> + '_ {
        let numeric = self
            .numeric_fields
            .iter()
            .enumerate()
            .map(move |(i, f)| (f.clone(), self.numeric_slot(i)));
        let oov = self
            .categorical_fields
            .iter()
            .enumerate()
            .map(move |(i, f)| (format!("{OOV_PREFIX}{f}"), self.oov_id(i)));
        let vocab = self
            .categorical_fields
            .iter()
            .zip(&self.entries)
            .flat_map(|(field, ids)| {
                ids.iter()
                    .map(move |(value, id)| (format!("{field}{KEY_SEPARATOR}{value}"), *id))
            });
        numeric.chain(oov).chain(vocab)
    }

    pub fn to_index_map(&self) -> IndexMap<String, u32> {
        self.iter().collect()
    }
}

// ============================================================================
// Vocabulary Store
// ============================================================================

/// Owns the accumulated statistics and, once finalized, the id mapping.
#[derive(Debug, Clone)]
pub struct VocabularyStore {
    layout: FieldLayout,
    numeric: Vec<NumericFieldStats>,
    categorical: Vec<CategoricalFieldStats>,
    skip_id_convert: bool,
    mapping: Option<VocabularyMapping>,
}

/// Path of a vocabulary artifact inside `dir`.
pub fn artifact_path(dir: &Path, prefix: &str, name: &str) -> PathBuf {
    dir.join(format!("{prefix}{name}"))
}

/// Atomically save one keyed map.
pub fn save_map<T: Serialize + ?Sized>(path: &Path, map: &T) -> Result<(), VocabError> {
    write_json_atomic(path, map)?;
    Ok(())
}

/// Load one keyed map.
pub fn load_map<T: DeserializeOwned>(path: &Path) -> Result<T, VocabError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn finite(bounds: IndexMap<String, f64>) -> Result<IndexMap<String, f64>, VocabError> {
    if let Some((field, value)) = bounds.iter().find(|(_, v)| !v.is_finite()) {
        return Err(VocabError::InvalidNumeric {
            field: field.clone(),
            value: value.to_string(),
        });
    }
    Ok(bounds)
}

fn check_fields<'a>(
    artifact: &'static str,
    expected: &[String],
    found: impl Iterator<Item = &'a String>,
) -> Result<(), VocabError> {
    let found: Vec<String> = found.cloned().collect();
    if found != expected {
        return Err(VocabError::FieldSetMismatch {
            artifact,
            expected: expected.to_vec(),
            found,
        });
    }
    Ok(())
}

impl VocabularyStore {
    /// Emit raw category strings as ids instead of mapped integers.
    pub fn with_skip_id_convert(mut self, skip_id_convert: bool) -> Self {
        self.skip_id_convert = skip_id_convert;
        self
    }

    pub fn skip_id_convert(&self) -> bool {
        self.skip_id_convert
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    pub fn numeric_stats(&self) -> &[NumericFieldStats] {
        &self.numeric
    }

    pub fn categorical_stats(&self) -> &[CategoricalFieldStats] {
        &self.categorical
    }

    pub fn numeric_min(&self) -> IndexMap<String, f64> {
        self.numeric
            .iter()
            .map(|s| (s.field_name.clone(), s.min_value))
            .collect()
    }

    pub fn numeric_max(&self) -> IndexMap<String, f64> {
        self.numeric
            .iter()
            .map(|s| (s.field_name.clone(), s.max_value))
            .collect()
    }

    pub fn category_counts(&self) -> IndexMap<String, IndexMap<String, u64>> {
        self.categorical
            .iter()
            .map(|s| (s.field_name.clone(), s.counts.clone()))
            .collect()
    }

    /// Write the three statistics maps into `dir`.
    ///
    /// Every map is staged to a temp file before any is renamed into place, so
    /// a failure while serializing leaves the previous artifacts untouched.
    /// Non-finite bounds are rejected: JSON would store them as `null`.
    pub fn persist(&self, dir: &Path, prefix: &str) -> Result<(), VocabError> {
        let min_path = artifact_path(dir, prefix, NUMERIC_MIN_FILE);
        let max_path = artifact_path(dir, prefix, NUMERIC_MAX_FILE);
        let count_path = artifact_path(dir, prefix, CATEGORY_COUNT_FILE);

        let staged = [
            (stage_json(&min_path, &finite(self.numeric_min())?)?, min_path),
            (stage_json(&max_path, &finite(self.numeric_max())?)?, max_path),
            (stage_json(&count_path, &self.category_counts())?, count_path),
        ];
        for (tmp, path) in staged {
            tmp.persist(&path).map_err(|e| VocabError::Io(e.error))?;
        }
        info!("  Saved vocabulary statistics to {}", dir.display());
        Ok(())
    }

    /// Reload statistics written by [`persist`](Self::persist).
    ///
    /// The returned store is not finalized, whatever state the writer was in.
    pub fn load(dir: &Path, prefix: &str, layout: FieldLayout) -> Result<Self, VocabError> {
        let mins: IndexMap<String, f64> = load_map(&artifact_path(dir, prefix, NUMERIC_MIN_FILE))?;
        let maxs: IndexMap<String, f64> = load_map(&artifact_path(dir, prefix, NUMERIC_MAX_FILE))?;
        let counts: IndexMap<String, IndexMap<String, u64>> =
            load_map(&artifact_path(dir, prefix, CATEGORY_COUNT_FILE))?;

        check_fields(NUMERIC_MIN_FILE, layout.numeric_fields(), mins.keys())?;
        check_fields(NUMERIC_MAX_FILE, layout.numeric_fields(), maxs.keys())?;
        check_fields(CATEGORY_COUNT_FILE, layout.categorical_fields(), counts.keys())?;

        let numeric = mins
            .into_iter()
            .zip(maxs.into_values())
            .map(|((field_name, min_value), max_value)| NumericFieldStats {
                field_name,
                min_value,
                max_value,
            })
            .collect::<Vec<_>>();
        let categorical = counts
            .into_iter()
            .map(|(field_name, counts)| CategoricalFieldStats { field_name, counts })
            .collect::<Vec<_>>();

        for stats in &numeric {
            info!(
                "  {}: min={} max={}",
                stats.field_name, stats.min_value, stats.max_value
            );
        }

        Ok(Self {
            layout,
            numeric,
            categorical,
            skip_id_convert: false,
            mapping: None,
        })
    }

    /// Assign ids to every category seen more than `threshold` times.
    pub fn finalize(&mut self, threshold: u64) -> Result<&VocabularyMapping, VocabError> {
        if self.mapping.is_some() {
            return Err(VocabError::AlreadyFinalized);
        }
        let mapping =
            VocabularyMapping::build(self.layout.numeric_fields(), &self.categorical, threshold)?;
        info!(
            "  Vocabulary finalized: {} ids ({} categories above threshold {})",
            mapping.len(),
            mapping.vocabulary_len(),
            threshold
        );
        Ok(self.mapping.insert(mapping))
    }

    pub fn is_finalized(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn mapping(&self) -> Result<&VocabularyMapping, VocabError> {
        self.mapping.as_ref().ok_or(VocabError::UnknownField)
    }

    /// Write the finalized composite-key → id map to `{prefix}cat2id.json`.
    pub fn persist_mapping(&self, dir: &Path, prefix: &str) -> Result<PathBuf, VocabError> {
        let path = artifact_path(dir, prefix, MAPPING_FILE);
        save_map(&path, &self.mapping()?.to_index_map())?;
        Ok(path)
    }

    /// Encode one row; see [`FeatureEncoder::encode`].
    pub fn encode(
        &self,
        numeric: &[&str],
        categorical: &[&str],
    ) -> Result<(Vec<FeatureId>, Vec<f32>), VocabError> {
        FeatureEncoder::new(self)?.encode(numeric, categorical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FieldLayout {
        FieldLayout::with_names(
            vec!["score".to_string()],
            vec!["id".to_string(), "color".to_string()],
        )
    }

    fn builder_with(rows: &[(&str, &str, &str)]) -> VocabularyBuilder {
        let mut b = VocabularyBuilder::new(layout());
        for &(score, id, color) in rows {
            b.observe_row(&[score], &[id, color]).unwrap();
        }
        b
    }

    #[test]
    fn numeric_min_is_seeded_at_zero() {
        let b = builder_with(&[("5", "a", "x"), ("10", "b", "x"), ("", "c", "y")]);
        let stats = &b.numeric_stats()[0];
        assert_eq!(stats.min_value, 0.0);
        assert_eq!(stats.max_value, 10.0);
    }

    #[test]
    fn numeric_min_from_data_tracks_true_minimum() {
        let mut b = VocabularyBuilder::new(layout()).with_min_tracking(MinTracking::FromData);
        b.observe_numeric(&["5"]).unwrap();
        b.observe_numeric(&[""]).unwrap();
        b.observe_numeric(&["7"]).unwrap();
        let stats = &b.numeric_stats()[0];
        assert_eq!(stats.min_value, 5.0);
        assert_eq!(stats.max_value, 7.0);
    }

    #[test]
    fn negative_values_lower_the_minimum() {
        let b = builder_with(&[("-3.5", "a", "x")]);
        assert_eq!(b.numeric_stats()[0].min_value, -3.5);
        assert_eq!(b.numeric_stats()[0].max_value, 0.0);
    }

    #[test]
    fn empty_category_is_counted() {
        let b = builder_with(&[("1", "", "x"), ("1", "", "x")]);
        assert_eq!(b.categorical_stats()[0].counts.get(""), Some(&2));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut b = VocabularyBuilder::new(layout());
        let err = b.observe_categorical(&["a"]).unwrap_err();
        assert!(matches!(
            err,
            VocabError::SchemaMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
        let err = b.observe_numeric(&["1", "2"]).unwrap_err();
        assert!(matches!(err, VocabError::SchemaMismatch { expected: 1, .. }));
    }

    #[test]
    fn rejected_row_leaves_stats_untouched() {
        let mut b = builder_with(&[("4", "a", "x")]);
        let before = b.clone().into_store().category_counts();
        assert!(b.observe_row(&["oops"], &["b", "y"]).is_err());
        assert!(b.observe_row(&["9"], &["b"]).is_err());
        assert_eq!(b.numeric_stats()[0].max_value, 4.0);
        assert_eq!(b.into_store().category_counts(), before);
    }

    #[test]
    fn finalize_assigns_numeric_then_oov_then_vocabulary() {
        let mut store = builder_with(&[
            ("1", "a", "x"),
            ("1", "b", "x"),
            ("1", "a", "y"),
            ("1", "a", "z"),
        ])
        .into_store();
        let mapping = store.finalize(1).unwrap();

        assert_eq!(mapping.get("score"), Some(0));
        assert_eq!(mapping.get("OOV_id"), Some(1));
        assert_eq!(mapping.get("OOV_color"), Some(2));
        assert_eq!(mapping.get("id_a"), Some(3));
        assert_eq!(mapping.get("color_x"), Some(4));
        assert_eq!(mapping.get("id_b"), None);
        assert_eq!(mapping.get("color_y"), None);
        assert_eq!(mapping.len(), 5);
    }

    #[test]
    fn threshold_is_strict() {
        // x appears twice, y once: only x clears threshold 1.
        let mut store = builder_with(&[("1", "a", "x"), ("1", "a", "x"), ("1", "a", "y")]).into_store();
        let mapping = store.finalize(1).unwrap();
        assert!(mapping.lookup(1, "x").is_some());
        assert!(mapping.lookup(1, "y").is_none());
    }

    #[test]
    fn ids_follow_first_seen_order() {
        let mut store = builder_with(&[("1", "a", "q"), ("1", "a", "b"), ("1", "a", "m")]).into_store();
        let mapping = store.finalize(0).unwrap();
        let q = mapping.lookup(1, "q").unwrap();
        let b = mapping.lookup(1, "b").unwrap();
        let m = mapping.lookup(1, "m").unwrap();
        assert!(q < b && b < m);
    }

    #[test]
    fn ids_are_dense_and_unique_for_any_threshold() {
        let rows: Vec<(String, String, String)> = (0..60)
            .map(|i| {
                (
                    format!("{i}"),
                    format!("id{}", i % 7),
                    format!("c{}", (i * i) % 11),
                )
            })
            .collect();
        let mut base = VocabularyBuilder::new(layout());
        for (s, a, c) in &rows {
            base.observe_row(&[s.as_str()], &[a.as_str(), c.as_str()]).unwrap();
        }
        let mut previous = usize::MAX;
        for threshold in 0..12 {
            let mut store = base.clone().into_store();
            let mapping = store.finalize(threshold).unwrap();
            let mut ids: Vec<u32> = mapping.iter().map(|(_, id)| id).collect();
            ids.sort_unstable();
            let expected: Vec<u32> = (0..mapping.len() as u32).collect();
            assert_eq!(ids, expected, "threshold {threshold}");
            assert!(mapping.vocabulary_len() <= previous);
            previous = mapping.vocabulary_len();
        }
    }

    #[test]
    fn finalize_twice_is_rejected() {
        let mut store = builder_with(&[("1", "a", "x")]).into_store();
        store.finalize(0).unwrap();
        assert!(matches!(store.finalize(0), Err(VocabError::AlreadyFinalized)));
    }

    #[test]
    fn encode_before_finalize_is_rejected() {
        let store = builder_with(&[("1", "a", "x")]).into_store();
        assert!(matches!(
            store.encode(&["1"], &["a", "x"]),
            Err(VocabError::UnknownField)
        ));
        assert!(matches!(store.mapping(), Err(VocabError::UnknownField)));
    }

    #[test]
    fn failed_persist_keeps_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let original = builder_with(&[("4", "a", "x")]).into_store();
        original.persist(dir.path(), "").unwrap();

        // The min map stages cleanly; the max map fails after it.
        let mut store = builder_with(&[("8", "b", "y")]).into_store();
        store.numeric[0].max_value = f64::NAN;
        assert!(matches!(
            store.persist(dir.path(), ""),
            Err(VocabError::InvalidNumeric { .. })
        ));

        let loaded = VocabularyStore::load(dir.path(), "", layout()).unwrap();
        assert_eq!(loaded.numeric_min(), original.numeric_min());
        assert_eq!(loaded.numeric_max(), original.numeric_max());
        assert_eq!(loaded.category_counts(), original.category_counts());
        // Only the three artifacts; no staged temp file survives.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn persist_then_load_round_trips_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let store = builder_with(&[("2.5", "a", "x"), ("-1", "b", "y"), ("", "a", "")]).into_store();
        store.persist(dir.path(), "run1_").unwrap();

        let loaded = VocabularyStore::load(dir.path(), "run1_", layout()).unwrap();
        assert_eq!(loaded.numeric_min(), store.numeric_min());
        assert_eq!(loaded.numeric_max(), store.numeric_max());
        assert_eq!(loaded.category_counts(), store.category_counts());
        // First-seen order survives the round trip.
        let colors: Vec<&String> = loaded.categorical_stats()[1].counts.keys().collect();
        assert_eq!(colors, vec!["x", "y", ""]);
        assert!(!loaded.is_finalized());
    }

    #[test]
    fn prefixes_isolate_runs() {
        let dir = tempfile::tempdir().unwrap();
        builder_with(&[("1", "a", "x")]).into_store().persist(dir.path(), "a_").unwrap();
        builder_with(&[("9", "b", "y")]).into_store().persist(dir.path(), "b_").unwrap();
        let a = VocabularyStore::load(dir.path(), "a_", layout()).unwrap();
        let b = VocabularyStore::load(dir.path(), "b_", layout()).unwrap();
        assert_eq!(a.numeric_max()["score"], 1.0);
        assert_eq!(b.numeric_max()["score"], 9.0);
    }

    #[test]
    fn load_rejects_foreign_layout() {
        let dir = tempfile::tempdir().unwrap();
        builder_with(&[("1", "a", "x")]).into_store().persist(dir.path(), "").unwrap();
        let other = FieldLayout::with_names(vec!["score".to_string()], vec!["id".to_string()]);
        assert!(matches!(
            VocabularyStore::load(dir.path(), "", other),
            Err(VocabError::FieldSetMismatch { .. })
        ));
    }

    #[test]
    fn each_map_loads_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = builder_with(&[("3", "a", "x"), ("3", "a", "x")]).into_store();
        store.persist(dir.path(), "").unwrap();
        let maxs: IndexMap<String, f64> =
            load_map(&artifact_path(dir.path(), "", NUMERIC_MAX_FILE)).unwrap();
        assert_eq!(maxs["score"], 3.0);
        let counts: IndexMap<String, IndexMap<String, u64>> =
            load_map(&artifact_path(dir.path(), "", CATEGORY_COUNT_FILE)).unwrap();
        assert_eq!(counts["color"]["x"], 2);
    }

    #[test]
    fn persisted_mapping_lists_ids_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = builder_with(&[("1", "a", "x"), ("1", "a", "x")]).into_store();
        store.finalize(1).unwrap();
        let path = store.persist_mapping(dir.path(), "").unwrap();
        let back: IndexMap<String, u32> = load_map(&path).unwrap();
        let keys: Vec<&str> = back.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["score", "OOV_id", "OOV_color", "id_a", "color_x"]);
        let ids: Vec<u32> = back.values().copied().collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn merge_matches_sequential_pass() {
        let rows = [
            ("4", "a", "x"),
            ("-2", "b", "y"),
            ("", "a", "z"),
            ("11", "c", "x"),
            ("3", "b", "w"),
        ];
        let sequential = builder_with(&rows);
        let mut left = builder_with(&rows[..2]);
        left.merge(builder_with(&rows[2..])).unwrap();

        let seq = sequential.into_store();
        let merged = left.into_store();
        assert_eq!(merged.numeric_min(), seq.numeric_min());
        assert_eq!(merged.numeric_max(), seq.numeric_max());
        assert_eq!(merged.category_counts(), seq.category_counts());
        let order: Vec<&String> = merged.categorical_stats()[1].counts.keys().collect();
        assert_eq!(order, vec!["x", "y", "z", "w"]);
    }
}
