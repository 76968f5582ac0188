use chrono::NaiveDate;

use crate::types::RecordId;

/// Persisted progress of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    /// Highest source id already processed, `None` before the first pass.
    pub last_id: Option<RecordId>,
    /// Day `sequence_count` belongs to.
    pub sync_date: NaiveDate,
    /// Sequence codes handed out on `sync_date`.
    pub sequence_count: u32,
}

impl Watermark {
    /// Watermark of an entity that has never been synced.
    pub fn initial(today: NaiveDate) -> Self {
        Self {
            last_id: None,
            sync_date: today,
            sequence_count: 0,
        }
    }

    /// Returns the watermark as seen on `today`; the sequence counter restarts on a new day.
    pub fn on(self, today: NaiveDate) -> Self {
        if self.sync_date == today {
            self
        } else {
            Self {
                last_id: self.last_id,
                sync_date: today,
                sequence_count: 0,
            }
        }
    }

    /// Returns the watermark after a pass that observed `max_id`. Never moves backwards.
    pub fn advanced(self, max_id: Option<RecordId>, sequence_count: u32) -> Self {
        let last_id = match (self.last_id, max_id) {
            (Some(current), Some(observed)) => Some(current.max(observed)),
            (current, observed) => current.or(observed),
        };

        Self {
            last_id,
            sync_date: self.sync_date,
            sequence_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    #[test]
    fn sequence_count_resets_on_new_day() {
        let watermark = Watermark {
            last_id: Some(10),
            sync_date: day(1),
            sequence_count: 7,
        };

        assert_eq!(watermark.on(day(1)).sequence_count, 7);

        let next_day = watermark.on(day(2));
        assert_eq!(next_day.sequence_count, 0);
        assert_eq!(next_day.sync_date, day(2));
        assert_eq!(next_day.last_id, Some(10));
    }

    #[test]
    fn advance_never_moves_backwards() {
        let watermark = Watermark {
            last_id: Some(100),
            sync_date: day(1),
            sequence_count: 0,
        };

        assert_eq!(watermark.advanced(Some(105), 2).last_id, Some(105));
        assert_eq!(watermark.advanced(Some(90), 0).last_id, Some(100));
        assert_eq!(watermark.advanced(None, 0).last_id, Some(100));
        assert_eq!(Watermark::initial(day(1)).advanced(Some(3), 0).last_id, Some(3));
    }
}
