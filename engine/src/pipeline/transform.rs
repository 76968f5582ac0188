//! Projection of source records into the external field format.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use sync_config::shared::{EntityConfig, SequenceCodeConfig, StatusPredicate, SubTableConfig};
use tracing::warn;

use crate::attributes::{AttributeExtractor, ProductTypeClassifier};
use crate::conversions::{format_date, format_timestamp};
use crate::error::{ErrorKind, SyncResult};
use crate::mapping::FieldMapping;
use crate::types::{
    DATE_FORMAT, KeyPart, NaturalKey, Payload, RawRecord, TransformedRecord, Value, Wrapped,
};
use crate::{bail, sync_error};

fn holds(predicate: &StatusPredicate, record: &RawRecord) -> bool {
    record.text(&predicate.field).as_deref() == Some(predicate.equals.trim())
}

/// Builds [`TransformedRecord`]s for one entity type.
pub struct Transformer {
    entity: EntityConfig,
    mapping: FieldMapping,
    /// Natural key fields with their external ids, in configured order.
    natural_key: Vec<(String, String)>,
    extractors: Vec<Box<dyn AttributeExtractor>>,
}

impl Transformer {
    /// Checks the mapping against the entity and prepares the transformer.
    ///
    /// Every natural key field must be mapped. Every sub-table needs both a field mapping and
    /// a main field id receiving its rows.
    pub fn new(entity: &EntityConfig, mapping: FieldMapping) -> SyncResult<Self> {
        let mut natural_key = Vec::with_capacity(entity.natural_key.len());
        for field in &entity.natural_key {
            let Some(field_id) = mapping.field_id(field) else {
                bail!(
                    ErrorKind::ConfigError,
                    "Natural key field is not mapped",
                    format!("{}.{field}", entity.name)
                );
            };
            natural_key.push((field.clone(), field_id.to_string()));
        }

        for SubTableConfig { name, .. } in &entity.sub_tables {
            if mapping.sub_table(name).is_none() || mapping.field_id(name).is_none() {
                bail!(
                    ErrorKind::ConfigError,
                    "Sub-table has no mapping",
                    format!("{}.{name}", entity.name)
                );
            }
        }

        let mut extractors: Vec<Box<dyn AttributeExtractor>> = Vec::new();
        if let Some(product_type) = &entity.product_type {
            extractors.push(Box::new(ProductTypeClassifier::new(product_type)));
        }

        Ok(Self {
            entity: entity.clone(),
            mapping,
            natural_key,
            extractors,
        })
    }

    /// Adds an attribute extractor run after the mapped fields.
    pub fn with_extractor(mut self, extractor: Box<dyn AttributeExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Returns `true` when every required field has a non-empty value.
    pub fn is_valid(&self, record: &RawRecord) -> bool {
        self.entity
            .required_fields
            .iter()
            .all(|field| record.text(field).is_some())
    }

    /// Projects `record` and its sub-table `children` into the external format.
    ///
    /// `children` maps sub-table names to the child rows of this record. Every mapped field is
    /// present in the output; absent source values become empty strings.
    pub fn transform(
        &self,
        record: &RawRecord,
        children: &BTreeMap<String, Vec<RawRecord>>,
        today: NaiveDate,
    ) -> SyncResult<TransformedRecord> {
        let mut fields = self.project(record, &self.mapping.main_fields)?;

        if let Some(stamp) = &self.entity.release_stamp {
            let value = if holds(&stamp.when, record) {
                today.format(DATE_FORMAT).to_string()
            } else {
                String::new()
            };
            fields.insert(stamp.field_id.clone(), Wrapped::text(value));
        }

        for extractor in &self.extractors {
            match extractor.extract(record) {
                Ok(attributes) => {
                    for (field_id, value) in attributes {
                        fields.insert(field_id, Wrapped::text(value));
                    }
                }
                Err(err) => {
                    warn!(
                        entity = %self.entity.name,
                        record_id = record.id(),
                        error = %err,
                        "attribute extraction failed, leaving attributes empty"
                    );
                }
            }
        }

        for sub_table in &self.entity.sub_tables {
            let Some(sub_mapping) = self.mapping.sub_table(&sub_table.name) else {
                continue;
            };
            let Some(sub_field_id) = self.mapping.field_id(&sub_table.name) else {
                continue;
            };

            let rows = children
                .get(&sub_table.name)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|child| self.project(child, sub_mapping))
                .collect::<SyncResult<Vec<_>>>()?;

            fields.insert(sub_field_id.to_string(), Wrapped::rows(rows));
        }

        Ok(TransformedRecord {
            source_id: record.id(),
            fields,
            natural_key: self.natural_key(record),
        })
    }

    /// Returns the natural key of `record`, or `None` if the entity has none or a part is empty.
    pub fn natural_key(&self, record: &RawRecord) -> Option<NaturalKey> {
        if self.natural_key.is_empty() {
            return None;
        }

        self.natural_key
            .iter()
            .map(|(field, field_id)| {
                record.text(field).map(|value| KeyPart {
                    field_id: field_id.clone(),
                    value,
                })
            })
            .collect::<Option<Vec<_>>>()
            .map(NaturalKey)
    }

    fn project(
        &self,
        record: &RawRecord,
        mapping: &BTreeMap<String, String>,
    ) -> SyncResult<Payload> {
        let mut renamed: BTreeMap<&str, &Value> = BTreeMap::new();
        for (name, value) in record.fields() {
            let name = self
                .entity
                .renames
                .get(name)
                .map(String::as_str)
                .unwrap_or(name);
            renamed.insert(name, value);
        }

        let mut payload = Payload::new();
        for (source_field, field_id) in mapping {
            let rendered = match renamed.get(source_field.as_str()) {
                None => String::new(),
                Some(value) => self.render(source_field, value)?,
            };
            payload.insert(field_id.clone(), Wrapped::text(rendered));
        }

        Ok(payload)
    }

    fn render(&self, field: &str, value: &Value) -> SyncResult<String> {
        if let Value::Float(number) = value
            && !number.is_finite()
        {
            return Err(sync_error!(
                ErrorKind::ConversionError,
                "Numeric field has no finite value",
                format!("{field}={number}")
            ));
        }

        let rendered = if self.entity.date_fields.iter().any(|f| f == field) {
            format_date(value)
        } else if self.entity.timestamp_fields.iter().any(|f| f == field) {
            format_timestamp(value)
        } else {
            value.render()
        };

        Ok(rendered)
    }
}

/// Hands out the per-day sequence codes of one pass.
#[derive(Debug, Clone)]
pub struct SequenceCodes {
    config: SequenceCodeConfig,
    alphabet: Vec<char>,
    count: u32,
    assigned: u32,
}

impl SequenceCodes {
    /// Starts at the count already used today.
    pub fn new(config: SequenceCodeConfig, count: u32) -> Self {
        let alphabet = config.alphabet.chars().collect();
        Self {
            config,
            alphabet,
            count,
            assigned: 0,
        }
    }

    /// Assigns the next code to `fields` if `record` meets the predicate.
    ///
    /// Past the end of the alphabet every code falls back to the first character.
    pub fn assign(&mut self, record: &RawRecord, fields: &mut Payload) -> bool {
        if !holds(&self.config.when, record) {
            return false;
        }

        let index = usize::try_from(self.count).unwrap_or(usize::MAX);
        let code = match self.alphabet.get(index) {
            Some(code) => *code,
            None => {
                warn!(
                    count = self.count,
                    alphabet_len = self.alphabet.len(),
                    record_id = record.id(),
                    "sequence code count exceeds alphabet, restarting at first code"
                );
                self.alphabet.first().copied().unwrap_or('A')
            }
        };

        fields.insert(self.config.field_id.clone(), Wrapped::text(code.to_string()));
        self.count = self.count.saturating_add(1);
        self.assigned += 1;

        true
    }

    /// Count to persist with the watermark.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Codes assigned during this pass.
    pub fn assigned(&self) -> u32 {
        self.assigned
    }
}

#[cfg(test)]
mod tests {
    use sync_config::shared::{DerivedFieldConfig, ExtractionMode, FoldMode};

    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn entity() -> EntityConfig {
        EntityConfig {
            name: "orders".to_string(),
            table: "oms_order".to_string(),
            entry_id: "entry".to_string(),
            mapping_path: "orders.json".into(),
            enabled: true,
            natural_key: vec!["job_num".to_string()],
            required_fields: vec!["job_num".to_string()],
            fold: FoldMode::ContentAndBusinessKey,
            fingerprint_exclude: vec!["id".to_string()],
            fingerprint_exclude_prefixes: vec![],
            renames: BTreeMap::from([("customer_sku".to_string(), "custumer_sku".to_string())]),
            date_fields: vec!["due_date".to_string()],
            timestamp_fields: vec![],
            sequence_code: None,
            release_stamp: Some(DerivedFieldConfig {
                field_id: "_widget_released".to_string(),
                when: StatusPredicate {
                    field: "job_status".to_string(),
                    equals: "released".to_string(),
                },
            }),
            product_type: None,
            update_suppressed_fields: vec!["_widget_released".to_string()],
            sub_tables: vec![SubTableConfig {
                name: "items".to_string(),
                table: "oms_order_item".to_string(),
                foreign_key: "order_id".to_string(),
            }],
            extraction: ExtractionMode::Cursor,
            batch_size: None,
            create_batch_size: None,
        }
    }

    fn mapping() -> FieldMapping {
        FieldMapping {
            main_fields: BTreeMap::from([
                ("job_num".to_string(), "_widget_job".to_string()),
                ("due_date".to_string(), "_widget_due".to_string()),
                ("custumer_sku".to_string(), "_widget_sku".to_string()),
                ("remark".to_string(), "_widget_remark".to_string()),
                ("items".to_string(), "_widget_items".to_string()),
            ]),
            sub_tables: BTreeMap::from([(
                "items".to_string(),
                BTreeMap::from([("part".to_string(), "_widget_part".to_string())]),
            )]),
        }
    }

    fn text<'a>(record: &'a TransformedRecord, field_id: &str) -> Option<&'a str> {
        record.fields.get(field_id).and_then(Wrapped::as_text)
    }

    #[test]
    fn maps_renames_and_formats_fields() {
        let transformer = Transformer::new(&entity(), mapping()).unwrap();
        let record = RawRecord::new(1)
            .with("job_num", " J-1 ")
            .with("due_date", "2025/06/30 00:00:00")
            .with("customer_sku", "SKU-9")
            .with("job_status", "released");

        let transformed = transformer
            .transform(&record, &BTreeMap::new(), today())
            .unwrap();

        assert_eq!(text(&transformed, "_widget_job"), Some("J-1"));
        assert_eq!(text(&transformed, "_widget_due"), Some("2025-06-30"));
        assert_eq!(text(&transformed, "_widget_sku"), Some("SKU-9"));
        assert_eq!(text(&transformed, "_widget_remark"), Some(""));
        assert_eq!(text(&transformed, "_widget_released"), Some("2025-06-01"));
        assert_eq!(
            transformed.natural_key,
            Some(NaturalKey(vec![KeyPart {
                field_id: "_widget_job".to_string(),
                value: "J-1".to_string(),
            }]))
        );
    }

    #[test]
    fn wraps_sub_table_rows() {
        let transformer = Transformer::new(&entity(), mapping()).unwrap();
        let record = RawRecord::new(1).with("job_num", "J-1");
        let children = BTreeMap::from([(
            "items".to_string(),
            vec![
                RawRecord::new(10).with("order_id", 1).with("part", "P-1"),
                RawRecord::new(11).with("order_id", 1).with("part", "P-2"),
            ],
        )]);

        let transformed = transformer.transform(&record, &children, today()).unwrap();

        assert_eq!(
            serde_json::to_value(transformed.fields.get("_widget_items").unwrap()).unwrap(),
            serde_json::json!({
                "value": [
                    { "_widget_part": { "value": "P-1" } },
                    { "_widget_part": { "value": "P-2" } }
                ]
            })
        );
    }

    #[test]
    fn create_and_update_payloads_differ_by_suppressed_fields() {
        let entity = entity();
        let transformer = Transformer::new(&entity, mapping()).unwrap();
        let record = RawRecord::new(1)
            .with("job_num", "J-1")
            .with("job_status", "released");

        let transformed = transformer
            .transform(&record, &BTreeMap::new(), today())
            .unwrap();
        let update = transformed.for_update(&entity.update_suppressed_fields);

        let removed: Vec<&String> = transformed
            .fields
            .keys()
            .filter(|key| !update.contains_key(*key))
            .collect();
        assert_eq!(removed, vec!["_widget_released"]);
        for (key, value) in &update {
            assert_eq!(transformed.fields.get(key), Some(value));
        }
    }

    #[test]
    fn non_finite_numbers_fail_the_record() {
        let transformer = Transformer::new(&entity(), mapping()).unwrap();
        let record = RawRecord::new(1)
            .with("job_num", "J-1")
            .with("remark", f64::NAN);

        let err = transformer
            .transform(&record, &BTreeMap::new(), today())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }

    #[test]
    fn validity_is_independent_of_key_completeness() {
        let mut entity = entity();
        entity.natural_key = vec!["job_num".to_string(), "remark".to_string()];
        let transformer = Transformer::new(&entity, mapping()).unwrap();
        let partial_key = RawRecord::new(1).with("job_num", "J-1");
        let no_job = RawRecord::new(2).with("remark", "rush");

        assert!(transformer.is_valid(&partial_key));
        assert!(!transformer.is_valid(&no_job));

        let transformed = transformer
            .transform(&partial_key, &BTreeMap::new(), today())
            .unwrap();
        assert_eq!(transformed.natural_key, None);
    }

    #[test]
    fn unmapped_natural_key_is_a_config_error() {
        let mut entity = entity();
        entity.natural_key = vec!["item_num".to_string()];

        let err = Transformer::new(&entity, mapping()).err().unwrap();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn sequence_codes_restart_past_alphabet() {
        let config = SequenceCodeConfig {
            field_id: "_widget_code".to_string(),
            when: StatusPredicate {
                field: "job_status".to_string(),
                equals: "released".to_string(),
            },
            alphabet: "AB".to_string(),
        };
        let mut codes = SequenceCodes::new(config, 1);
        let released = RawRecord::new(1).with("job_status", " released ");
        let draft = RawRecord::new(2).with("job_status", "draft");

        let mut assigned = Vec::new();
        for _ in 0..3 {
            let mut fields = Payload::new();
            assert!(codes.assign(&released, &mut fields));
            assigned.push(fields["_widget_code"].as_text().unwrap().to_string());
        }
        assert!(!codes.assign(&draft, &mut Payload::new()));

        assert_eq!(assigned, vec!["B", "A", "A"]);
        assert_eq!(codes.count(), 4);
        assert_eq!(codes.assigned(), 3);
    }
}
