//! Per-file editing time over the last ~70 minutes.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::flow::bucket::Timeline;

/// Buckets retained by the file-activity timeline (70 minutes).
pub const MAX_FILE_ACTIVITY_BUCKETS: usize = 14;

/// One editor record's contribution to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileActivityEntry {
    pub module: String,
    pub file_path: String,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileBucket {
    pub entries: Vec<FileActivityEntry>,
}

/// Total editing time for one file across the retained buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileActivitySummary {
    pub module: String,
    pub file_path: String,
    pub duration_seconds: u64,
}

/// Time-bucketed record of which files were being edited.
#[derive(Debug, Clone, Default)]
pub struct FileActivityTimeline {
    timeline: Timeline<FileBucket>,
}

impl FileActivityTimeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds editing time for a file in `time`'s bucket.
    ///
    /// When the timeline grows past its cap the oldest buckets roll off.
    pub fn record(&mut self, time: NaiveDateTime, entry: FileActivityEntry) {
        self.timeline.slot_mut(time).entries.push(entry);
        if self.timeline.len() > MAX_FILE_ACTIVITY_BUCKETS {
            self.timeline.retain_newest(MAX_FILE_ACTIVITY_BUCKETS);
        }
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.timeline.len()
    }

    /// Sums duration per `(module, file)` and sorts by descending total.
    #[must_use]
    pub fn report(&self) -> Vec<FileActivitySummary> {
        let mut totals: HashMap<(&str, &str), u64> = HashMap::new();
        for (_, bucket) in self.timeline.iter() {
            for entry in &bucket.entries {
                *totals
                    .entry((entry.module.as_str(), entry.file_path.as_str()))
                    .or_default() += entry.duration_seconds;
            }
        }

        let mut report: Vec<FileActivitySummary> = totals
            .into_iter()
            .map(|((module, file_path), duration_seconds)| FileActivitySummary {
                module: module.to_string(),
                file_path: file_path.to_string(),
                duration_seconds,
            })
            .collect();

        report.sort_by(|a, b| {
            b.duration_seconds
                .cmp(&a.duration_seconds)
                .then_with(|| a.module.cmp(&b.module))
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        report
    }
}
