//! End-time de-duplication for re-read log files.
//!
//! The watcher re-reads the whole live log on every change, so records seen
//! on an earlier read come around again. Only records that end after the
//! latest end time already processed are let through.

use chrono::NaiveDateTime;

use crate::types::ActivityRecord;

#[derive(Debug, Clone, Default)]
pub struct RecordDeduplicator {
    last_timestamp: Option<NaiveDateTime>,
}

impl RecordDeduplicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.last_timestamp
    }

    /// Filters one read's worth of records and advances the watermark.
    ///
    /// With no watermark yet, every record passes.
    pub fn admit(&mut self, records: Vec<ActivityRecord>) -> Vec<ActivityRecord> {
        let watermark = self.last_timestamp;

        let admitted: Vec<ActivityRecord> = records
            .into_iter()
            .filter(|record| watermark.map_or(true, |last| record.end_time() > last))
            .collect();

        if let Some(latest) = admitted.iter().map(ActivityRecord::end_time).max() {
            if watermark.map_or(true, |last| latest > last) {
                self.last_timestamp = Some(latest);
            }
        }

        admitted
    }
}
