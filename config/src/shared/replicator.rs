use std::collections::HashSet;

use serde::Deserialize;

use crate::Config;
use crate::shared::{
    BatchConfig, EntityConfig, PullConfig, RetryConfig, ScheduleConfig, SinkConfig, SourceConfig,
    ValidationError,
};

/// Complete configuration of the replicator service.
///
/// Intentionally does not implement [`serde::Serialize`] because the source password and the
/// sink token live in here.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    /// External databases mirrored into local tables before the push passes run.
    #[serde(default)]
    pub pulls: Vec<PullConfig>,
}

impl ReplicatorConfig {
    /// Validates every section; the replicator refuses to start on the first error.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.sink.validate()?;
        self.batch.validate()?;
        self.retry.validate()?;
        self.schedule.validate()?;

        let mut names = HashSet::new();
        for entity in &self.entities {
            entity.validate()?;

            if !names.insert(entity.name.as_str()) {
                return Err(ValidationError::DuplicateEntity(entity.name.clone()));
            }
        }

        let mut pulls = HashSet::new();
        for pull in &self.pulls {
            pull.validate()?;

            if !pulls.insert(pull.name.as_str()) {
                return Err(ValidationError::DuplicatePull(pull.name.clone()));
            }

            if let Some(entity) = &pull.push_entity
                && !names.contains(entity.as_str())
            {
                return Err(ValidationError::InvalidFieldValue {
                    field: format!("pulls.{}.push_entity", pull.name),
                    constraint: format!("no entity named `{entity}` is configured"),
                });
            }
        }

        Ok(())
    }

    /// Returns the enabled pulls, in configuration order.
    pub fn enabled_pulls(&self) -> impl Iterator<Item = &PullConfig> {
        self.pulls.iter().filter(|pull| pull.enabled)
    }

    /// Returns the enabled entities, in configuration order.
    pub fn enabled_entities(&self) -> impl Iterator<Item = &EntityConfig> {
        self.entities.iter().filter(|entity| entity.enabled)
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
