//! Per-row feature encoding against a finalized vocabulary.

use crate::common::FeatureId;
use crate::vocab::{VocabError, VocabularyMapping, VocabularyStore, parse_numeric};

/// Turns raw field values into `(feature_id, feature_weight)` pairs.
///
/// Numeric fields emit their slot id with weight `value / max`. A missing
/// numeric value emits the field's ordinal position with weight 0; numeric
/// slots are numbered `0..dense_dim`, so that is also the slot id.
/// Categorical fields emit the mapped id (or the raw value when id conversion
/// is skipped) and fall back to the field's OOV id, always with weight 1.
#[derive(Debug, Clone)]
pub struct FeatureEncoder<'a> {
    mapping: &'a VocabularyMapping,
    numeric_fields: &'a [String],
    max_values: Vec<f64>,
    skip_id_convert: bool,
}

impl<'a> FeatureEncoder<'a> {
    /// Fails with [`VocabError::UnknownField`] if the store is not finalized.
    pub fn new(store: &'a VocabularyStore) -> Result<Self, VocabError> {
        let mapping = store.mapping()?;
        Ok(Self {
            mapping,
            numeric_fields: store.layout().numeric_fields(),
            max_values: store.numeric_stats().iter().map(|s| s.max_value).collect(),
            skip_id_convert: store.skip_id_convert(),
        })
    }

    pub fn features_per_row(&self) -> usize {
        self.max_values.len() + self.mapping.num_categorical_fields()
    }

    pub fn encode(
        &self,
        numeric: &[&str],
        categorical: &[&str],
    ) -> Result<(Vec<FeatureId>, Vec<f32>), VocabError> {
        let mut ids = Vec::with_capacity(self.features_per_row());
        let mut weights = Vec::with_capacity(self.features_per_row());
        self.encode_into(numeric, categorical, &mut ids, &mut weights)?;
        Ok((ids, weights))
    }

    /// Append one row's features to `ids` and `weights`.
    ///
    /// The row is validated first; on error nothing is appended.
    pub fn encode_into(
        &self,
        numeric: &[&str],
        categorical: &[&str],
        ids: &mut Vec<FeatureId>,
        weights: &mut Vec<f32>,
    ) -> Result<(), VocabError> {
        if numeric.len() != self.max_values.len() {
            return Err(VocabError::SchemaMismatch {
                kind: "numeric",
                expected: self.max_values.len(),
                found: numeric.len(),
            });
        }
        if categorical.len() != self.mapping.num_categorical_fields() {
            return Err(VocabError::SchemaMismatch {
                kind: "categorical",
                expected: self.mapping.num_categorical_fields(),
                found: categorical.len(),
            });
        }
        let parsed = self
            .numeric_fields
            .iter()
            .zip(numeric)
            .map(|(field, raw)| parse_numeric(field, raw))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, value) in parsed.into_iter().enumerate() {
            match value {
                None => {
                    ids.push(FeatureId::Int(i as u32));
                    weights.push(0.0);
                }
                Some(v) => {
                    ids.push(FeatureId::Int(self.mapping.numeric_slot(i)));
                    weights.push(min_max_scale(v, self.max_values[i]));
                }
            }
        }

        for (i, value) in categorical.iter().enumerate() {
            let id = match self.mapping.lookup(i, value) {
                Some(_) if self.skip_id_convert => FeatureId::Raw(value.to_string()),
                Some(id) => FeatureId::Int(id),
                None => FeatureId::Int(self.mapping.oov_id(i)),
            };
            ids.push(id);
            weights.push(1.0);
        }
        Ok(())
    }
}

/// Scale by the field maximum. A field that never exceeded 0 scales to 0.
fn min_max_scale(value: f64, max: f64) -> f32 {
    if max == 0.0 {
        return 0.0;
    }
    (value / max) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FieldLayout;
    use crate::vocab::VocabularyBuilder;

    /// Three rows of `id,label,cat2,cat3,num`: a,1.0,x,y,{5,10,""}.
    fn scenario_store(threshold: u64) -> VocabularyStore {
        let layout = FieldLayout::new(1, 3);
        let mut builder = VocabularyBuilder::new(layout.clone());
        for (id, cat, num) in [("a", "x", "5"), ("a", "x", "10"), ("a", "z", "")] {
            let fields = [id, "1.0", cat, "y", num];
            let row = layout.split_fields(&fields).unwrap();
            builder.observe_row(&row.numeric, &row.categorical).unwrap();
        }
        let mut store = builder.into_store();
        store.finalize(threshold).unwrap();
        store
    }

    #[test]
    fn numeric_weights_scale_by_field_max() {
        let store = scenario_store(0);
        assert_eq!(store.numeric_stats()[0].min_value, 0.0);
        assert_eq!(store.numeric_stats()[0].max_value, 10.0);

        let (ids, weights) = store.encode(&["5"], &["a", "x", "y"]).unwrap();
        assert_eq!(ids[0], FeatureId::Int(0));
        assert_eq!(weights[0], 0.5);
    }

    #[test]
    fn missing_numeric_emits_ordinal_with_zero_weight() {
        let store = scenario_store(0);
        let (ids, weights) = store.encode(&[""], &["a", "x", "y"]).unwrap();
        assert_eq!(ids[0], FeatureId::Int(0));
        assert_eq!(weights[0], 0.0);
    }

    #[test]
    fn output_has_one_feature_per_field() {
        let store = scenario_store(0);
        let (ids, weights) = store.encode(&["7"], &["a", "x", "y"]).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(weights.len(), 4);
        assert_eq!(&weights[1..], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn below_threshold_values_fall_back_to_oov() {
        // x is seen twice, z once: threshold 1 keeps x only.
        let store = scenario_store(1);
        let mapping = store.mapping().unwrap();
        let (ids, _) = store.encode(&["5"], &["a", "z", "y"]).unwrap();
        assert_eq!(ids[2], FeatureId::Int(mapping.oov_id(1)));
        let (ids, _) = store.encode(&["5"], &["a", "x", "y"]).unwrap();
        assert_eq!(ids[2], FeatureId::Int(mapping.lookup(1, "x").unwrap()));
        // Never-seen values are OOV too.
        let (ids, _) = store.encode(&["5"], &["nope", "x", "y"]).unwrap();
        assert_eq!(ids[1], FeatureId::Int(mapping.oov_id(0)));
    }

    #[test]
    fn skip_id_convert_passes_known_values_through() {
        let store = scenario_store(1).with_skip_id_convert(true);
        let (ids, _) = store.encode(&["5"], &["a", "x", "unseen"]).unwrap();
        assert_eq!(ids[1], FeatureId::Raw("a".to_string()));
        assert_eq!(ids[2], FeatureId::Raw("x".to_string()));
        // Unknown values still resolve to the OOV id.
        assert_eq!(ids[3], FeatureId::Int(store.mapping().unwrap().oov_id(2)));
    }

    #[test]
    fn zero_max_scales_to_zero() {
        let layout = FieldLayout::new(1, 1);
        let mut builder = VocabularyBuilder::new(layout);
        builder.observe_row(&["-4"], &["a"]).unwrap();
        let mut store = builder.into_store();
        store.finalize(0).unwrap();
        let (_, weights) = store.encode(&["-4"], &["a"]).unwrap();
        assert_eq!(weights[0], 0.0);
    }

    #[test]
    fn invalid_row_appends_nothing() {
        let store = scenario_store(0);
        let encoder = FeatureEncoder::new(&store).unwrap();
        let mut ids = Vec::new();
        let mut weights = Vec::new();
        assert!(matches!(
            encoder.encode_into(&["abc"], &["a", "x", "y"], &mut ids, &mut weights),
            Err(VocabError::InvalidNumeric { .. })
        ));
        assert!(matches!(
            encoder.encode_into(&["1"], &["a", "x"], &mut ids, &mut weights),
            Err(VocabError::SchemaMismatch { .. })
        ));
        assert!(ids.is_empty() && weights.is_empty());
    }
}
