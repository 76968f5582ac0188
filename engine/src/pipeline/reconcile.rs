use tracing::debug;

use crate::error::SyncResult;
use crate::retry::RetryPolicy;
use crate::sink::{Condition, Sink};
use crate::types::{Decision, NaturalKey};

/// Decides between create and update by looking records up in the external system.
///
/// Nothing is cached: every call queries the sink.
#[derive(Debug, Clone)]
pub struct Reconciler {
    entry_id: String,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(entry_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            entry_id: entry_id.into(),
            retry,
        }
    }

    /// Returns [`Decision::Update`] when an external entity matches every part of `key`.
    ///
    /// A record without a natural key is always created. Lookup failures are returned so the
    /// caller can leave the record out of the pass.
    pub async fn reconcile<K>(&self, sink: &K, key: Option<&NaturalKey>) -> SyncResult<Decision>
    where
        K: Sink + Sync,
    {
        let Some(key) = key else {
            return Ok(Decision::Create);
        };

        let conditions: Vec<Condition> = key
            .parts()
            .iter()
            .map(|part| Condition::new(part.field_id.clone(), part.value.clone()))
            .collect();

        let found = self
            .retry
            .run("query_by_fields", || {
                sink.query_by_fields(&self.entry_id, &conditions)
            })
            .await?;

        match found {
            Some(entity) if entity.matches(&conditions) => {
                debug!(external_id = %entity.id, "matched existing external entity");
                Ok(Decision::Update(entity.id))
            }
            Some(entity) => {
                debug!(
                    external_id = %entity.id,
                    "lookup returned an entity not matching every key field, creating"
                );
                Ok(Decision::Create)
            }
            None => Ok(Decision::Create),
        }
    }
}
