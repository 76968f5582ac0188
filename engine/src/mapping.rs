//! Source field to external field id mappings, loaded once at startup.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Mapping of one entity type, read from a JSON file shaped like
/// `{"main_fields": {src: dest}, "sub_tables": {name: {src: dest}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FieldMapping {
    #[serde(default)]
    pub main_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub sub_tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl FieldMapping {
    /// Reads and parses a mapping file. A missing or empty mapping is a startup error.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => bail!(
                ErrorKind::MappingMissing,
                "Field mapping file could not be read",
                format!("{}: {err}", path.display())
            ),
        };

        let mapping: FieldMapping = match serde_json::from_str(&content) {
            Ok(mapping) => mapping,
            Err(err) => bail!(
                ErrorKind::ConfigError,
                "Field mapping file is not valid JSON",
                format!("{}: {err}", path.display())
            ),
        };

        if mapping.main_fields.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "Field mapping has no main fields",
                path.display()
            );
        }

        Ok(mapping)
    }

    /// Returns the external field id of a source field.
    pub fn field_id(&self, source_field: &str) -> Option<&str> {
        self.main_fields.get(source_field).map(String::as_str)
    }

    pub fn sub_table(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sub_tables.get(name)
    }
}
