//! Attributes derived from free-text source fields.

use std::collections::BTreeMap;

use sync_config::shared::ProductTypeConfig;

use crate::error::SyncResult;
use crate::types::RawRecord;

/// Derives extra external fields from a record.
///
/// Failures are never fatal: the transformer logs them and carries on with no attributes.
pub trait AttributeExtractor: Send + Sync {
    /// Returns external field ids and their values.
    fn extract(&self, record: &RawRecord) -> SyncResult<BTreeMap<String, String>>;
}

/// Extractor producing nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAttributeExtractor;

impl AttributeExtractor for NoopAttributeExtractor {
    fn extract(&self, _record: &RawRecord) -> SyncResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

/// Classifies a product by case-insensitive substring rules; the first matching rule wins.
///
/// A record with no category, or no matching rule, gets an empty value so a stale
/// classification is cleared on update.
#[derive(Debug, Clone)]
pub struct ProductTypeClassifier {
    source_field: String,
    field_id: String,
    rules: Vec<(String, String)>,
}

impl ProductTypeClassifier {
    pub fn new(config: &ProductTypeConfig) -> Self {
        Self {
            source_field: config.source_field.clone(),
            field_id: config.field_id.clone(),
            rules: config
                .rules
                .iter()
                .map(|rule| (rule.contains.to_uppercase(), rule.value.clone()))
                .collect(),
        }
    }

    fn classify(&self, category: &str) -> Option<&str> {
        let category = category.to_uppercase();
        self.rules
            .iter()
            .find(|(needle, _)| category.contains(needle.as_str()))
            .map(|(_, value)| value.as_str())
    }
}

impl AttributeExtractor for ProductTypeClassifier {
    fn extract(&self, record: &RawRecord) -> SyncResult<BTreeMap<String, String>> {
        let value = record
            .text(&self.source_field)
            .and_then(|category| self.classify(&category).map(str::to_string))
            .unwrap_or_default();

        Ok(BTreeMap::from([(self.field_id.clone(), value)]))
    }
}
