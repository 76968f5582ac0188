//! Content and business-key folding of an extracted batch.

use std::collections::{BTreeMap, HashMap};

use sync_config::shared::EntityConfig;

use crate::types::{Candidate, RawRecord};

/// Fields ignored when fingerprinting a record.
#[derive(Debug, Clone, Default)]
pub struct FingerprintRules {
    excluded: Vec<String>,
    excluded_prefixes: Vec<String>,
}

impl FingerprintRules {
    pub fn new(excluded: Vec<String>, excluded_prefixes: Vec<String>) -> Self {
        Self {
            excluded,
            excluded_prefixes,
        }
    }

    pub fn from_entity(entity: &EntityConfig) -> Self {
        Self::new(
            entity.fingerprint_exclude.clone(),
            entity.fingerprint_exclude_prefixes.clone(),
        )
    }

    fn is_excluded(&self, field: &str) -> bool {
        self.excluded.iter().any(|excluded| excluded == field)
            || self
                .excluded_prefixes
                .iter()
                .any(|prefix| field.starts_with(prefix.as_str()))
    }
}

/// Canonical `name=value|` rendering of the business fields of a record, in name order.
pub fn fingerprint(record: &RawRecord, rules: &FingerprintRules) -> String {
    let mut fingerprint = String::new();
    for (name, value) in record.fields() {
        if rules.is_excluded(name) {
            continue;
        }

        fingerprint.push_str(name);
        fingerprint.push('=');
        fingerprint.push_str(&value.render());
        fingerprint.push('|');
    }

    fingerprint
}

/// Keeps the highest-id record of every distinct fingerprint.
///
/// The output is sorted by ascending id.
pub fn content_fold(records: Vec<RawRecord>, rules: &FingerprintRules) -> Vec<RawRecord> {
    let mut latest: HashMap<String, RawRecord> = HashMap::with_capacity(records.len());

    for record in records {
        let key = fingerprint(&record, rules);
        match latest.get(&key) {
            Some(kept) if kept.id() >= record.id() => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }

    let mut folded: Vec<RawRecord> = latest.into_values().collect();
    folded.sort_by_key(RawRecord::id);

    folded
}

/// Groups records by natural key. In every group of more than one record the lowest id stays a
/// create candidate and the others become delayed updates.
///
/// Records missing any key field pass through unchanged. The output is sorted by ascending id.
pub fn business_key_fold(records: Vec<RawRecord>, key_fields: &[String]) -> Vec<Candidate> {
    let mut groups: BTreeMap<Vec<String>, Vec<RawRecord>> = BTreeMap::new();
    let mut candidates = Vec::with_capacity(records.len());

    for record in records {
        let key: Option<Vec<String>> = key_fields.iter().map(|field| record.text(field)).collect();
        match key {
            Some(key) if !key_fields.is_empty() => groups.entry(key).or_default().push(record),
            _ => candidates.push(Candidate::new(record)),
        }
    }

    for (_, mut group) in groups {
        group.sort_by_key(RawRecord::id);

        let mut members = group.into_iter();
        if let Some(first) = members.next() {
            candidates.push(Candidate::new(first));
        }
        candidates.extend(members.map(Candidate::delayed));
    }

    candidates.sort_by_key(Candidate::id);

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> FingerprintRules {
        FingerprintRules::new(
            vec!["id".to_string(), "sync_batch".to_string()],
            vec!["_widget_".to_string()],
        )
    }

    fn ids(records: &[RawRecord]) -> Vec<i64> {
        records.iter().map(RawRecord::id).collect()
    }

    #[test]
    fn fingerprint_ignores_excluded_fields() {
        let a = RawRecord::new(1)
            .with("job_num", "J-1")
            .with("sync_batch", 7)
            .with("_widget_123", "x");
        let b = RawRecord::new(2).with("job_num", " J-1 ").with("sync_batch", 8);

        assert_eq!(fingerprint(&a, &rules()), "job_num=J-1|");
        assert_eq!(fingerprint(&a, &rules()), fingerprint(&b, &rules()));
    }

    #[test]
    fn identical_content_keeps_max_id() {
        let records = [4, 9, 2, 7]
            .map(|id| RawRecord::new(id).with("job_num", "J-1").with("qty", 5))
            .to_vec();

        let folded = content_fold(records, &rules());

        assert_eq!(ids(&folded), vec![9]);
    }

    #[test]
    fn content_fold_of_ids_101_to_105() {
        let records = vec![
            RawRecord::new(101).with("job_num", "A"),
            RawRecord::new(102).with("job_num", "B"),
            RawRecord::new(103).with("job_num", "C"),
            RawRecord::new(104).with("job_num", "C"),
            RawRecord::new(105).with("job_num", "D"),
        ];

        let folded = content_fold(records, &rules());

        assert_eq!(ids(&folded), vec![101, 102, 104, 105]);
    }

    #[test]
    fn business_key_group_keeps_lowest_id_as_create_candidate() {
        let key = vec!["job_num".to_string()];
        let records = vec![
            RawRecord::new(9).with("job_num", "J-1").with("rev", 3),
            RawRecord::new(5).with("job_num", "J-1").with("rev", 1),
            RawRecord::new(7).with("job_num", "J-1").with("rev", 2),
        ];

        let candidates = business_key_fold(records, &key);

        let flags: Vec<(i64, bool)> = candidates
            .iter()
            .map(|candidate| (candidate.id(), candidate.delayed_update))
            .collect();
        assert_eq!(flags, vec![(5, false), (7, true), (9, true)]);
    }

    #[test]
    fn records_without_key_bypass_grouping() {
        let key = vec!["job_num".to_string()];
        let records = vec![
            RawRecord::new(1).with("job_num", ""),
            RawRecord::new(2),
            RawRecord::new(3).with("job_num", "J-1"),
        ];

        let candidates = business_key_fold(records, &key);

        assert!(candidates.iter().all(|candidate| !candidate.delayed_update));
        assert_eq!(candidates.len(), 3);
    }
}
