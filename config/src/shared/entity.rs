use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Fields ignored by the content fingerprint unless overridden.
pub const DEFAULT_FINGERPRINT_EXCLUDE: &[&str] = &["id", "sid", "sync_batch", "job_version"];

/// Alphabet used for sequence codes: 23 letters and 10 digits, without `I`, `O` and `Z`.
pub const DEFAULT_SEQUENCE_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXY0123456789";

/// Default cap on delivery attempts for pending-mode extraction.
pub const DEFAULT_PENDING_MAX_ATTEMPTS: u32 = 10;

/// How duplicates are folded before transformation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldMode {
    /// Collapse content-identical rows to the highest id.
    #[default]
    Content,
    /// Content fold followed by the natural-key fold.
    ContentAndBusinessKey,
}

/// Where a pass reads its rows from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExtractionMode {
    /// Rows with an id above the stored watermark.
    #[default]
    Cursor,
    /// Rows the delivery ledger has not yet marked as delivered.
    Pending {
        #[serde(default = "default_pending_max_attempts")]
        max_attempts: u32,
    },
}

/// Equality test on a source field, compared after trimming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPredicate {
    pub field: String,
    pub equals: String,
}

/// A derived external field computed when a predicate holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedFieldConfig {
    /// External field id receiving the derived value.
    pub field_id: String,
    pub when: StatusPredicate,
}

/// Sequence code settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceCodeConfig {
    pub field_id: String,
    pub when: StatusPredicate,
    #[serde(default = "default_sequence_alphabet")]
    pub alphabet: String,
}

/// One rule of the product type classifier: first matching substring wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub contains: String,
    pub value: String,
}

/// Derives a product type from a free-text category field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductTypeConfig {
    pub source_field: String,
    pub field_id: String,
    #[serde(default = "default_classifier_rules")]
    pub rules: Vec<ClassifierRule>,
}

/// Child table mapped into a sub-form of the parent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTableConfig {
    /// Key of the sub-table in the field mapping file.
    pub name: String,
    pub table: String,
    /// Column of the child table referencing the parent id.
    pub foreign_key: String,
}

/// Everything needed to run one entity type through the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Watermark key and log label, e.g. `orders`.
    pub name: String,
    /// Source table read by the extractor.
    pub table: String,
    /// External form receiving the records.
    pub entry_id: String,
    /// JSON field mapping with `main_fields` and `sub_tables`.
    pub mapping_path: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Source fields forming the natural key. Empty means every record is created.
    ///
    /// A record missing part of its key is created without a lookup.
    #[serde(default)]
    pub natural_key: Vec<String>,
    /// Source fields a record must carry to be synced at all. Records missing one are counted
    /// as invalid and skipped.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub fold: FoldMode,
    #[serde(default = "default_fingerprint_exclude")]
    pub fingerprint_exclude: Vec<String>,
    #[serde(default)]
    pub fingerprint_exclude_prefixes: Vec<String>,
    /// Source field renames applied before the mapping lookup.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    #[serde(default)]
    pub date_fields: Vec<String>,
    #[serde(default)]
    pub timestamp_fields: Vec<String>,
    #[serde(default)]
    pub sequence_code: Option<SequenceCodeConfig>,
    /// One-time date stamp, usually listed in `update_suppressed_fields`.
    #[serde(default)]
    pub release_stamp: Option<DerivedFieldConfig>,
    #[serde(default)]
    pub product_type: Option<ProductTypeConfig>,
    /// External field ids never sent on update.
    #[serde(default)]
    pub update_suppressed_fields: Vec<String>,
    #[serde(default)]
    pub sub_tables: Vec<SubTableConfig>,
    #[serde(default)]
    pub extraction: ExtractionMode,
    /// Overrides `batch.max_size` for this entity.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Overrides `batch.create_size` for this entity.
    #[serde(default)]
    pub create_batch_size: Option<usize>,
}

impl EntityConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("entities.name".to_string()));
        }

        for (field, value) in [("table", &self.table), ("entry_id", &self.entry_id)] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(format!(
                    "entities.{}.{field}",
                    self.name
                )));
            }
        }

        if self.fold == FoldMode::ContentAndBusinessKey && self.natural_key.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("entities.{}.fold", self.name),
                constraint: "business key folding requires a natural_key".to_string(),
            });
        }

        if self.required_fields.iter().any(|field| field.trim().is_empty()) {
            return Err(ValidationError::EmptyField(format!(
                "entities.{}.required_fields",
                self.name
            )));
        }

        if let Some(sequence_code) = &self.sequence_code
            && sequence_code.alphabet.is_empty()
        {
            return Err(ValidationError::EmptyField(format!(
                "entities.{}.sequence_code.alphabet",
                self.name
            )));
        }

        for (field, size) in [
            ("batch_size", self.batch_size),
            ("create_batch_size", self.create_batch_size),
        ] {
            if size == Some(0) {
                return Err(ValidationError::InvalidFieldValue {
                    field: format!("entities.{}.{field}", self.name),
                    constraint: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_fingerprint_exclude() -> Vec<String> {
    DEFAULT_FINGERPRINT_EXCLUDE
        .iter()
        .map(|field| field.to_string())
        .collect()
}

fn default_sequence_alphabet() -> String {
    DEFAULT_SEQUENCE_ALPHABET.to_string()
}

fn default_pending_max_attempts() -> u32 {
    DEFAULT_PENDING_MAX_ATTEMPTS
}

fn default_classifier_rules() -> Vec<ClassifierRule> {
    [("MICRO SD", "TF"), ("UPA", "UPA"), ("UDP", "UDP"), ("SD", "SD")]
        .into_iter()
        .map(|(contains, value)| ClassifierRule {
            contains: contains.to_string(),
            value: value.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_entity_gets_defaults() {
        let entity: EntityConfig = serde_json::from_value(serde_json::json!({
            "name": "orders",
            "table": "oms_order",
            "entry_id": "entry",
            "mapping_path": "field_mapping.json"
        }))
        .unwrap();

        assert!(entity.enabled);
        assert_eq!(entity.fold, FoldMode::Content);
        assert_eq!(entity.extraction, ExtractionMode::Cursor);
        assert_eq!(
            entity.fingerprint_exclude,
            vec!["id", "sid", "sync_batch", "job_version"]
        );
        entity.validate().unwrap();
    }

    #[test]
    fn pending_extraction_defaults_attempt_cap() {
        let mode: ExtractionMode =
            serde_json::from_value(serde_json::json!({ "mode": "pending" })).unwrap();

        assert_eq!(
            mode,
            ExtractionMode::Pending {
                max_attempts: DEFAULT_PENDING_MAX_ATTEMPTS
            }
        );
    }

    #[test]
    fn business_key_fold_requires_natural_key() {
        let entity: EntityConfig = serde_json::from_value(serde_json::json!({
            "name": "orders",
            "table": "oms_order",
            "entry_id": "entry",
            "mapping_path": "field_mapping.json",
            "fold": "content_and_business_key"
        }))
        .unwrap();

        assert!(matches!(
            entity.validate(),
            Err(ValidationError::InvalidFieldValue { .. })
        ));
    }
}
