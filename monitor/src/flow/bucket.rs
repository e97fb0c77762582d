//! Five-minute bucket timelines.
//!
//! Both the momentum counter and the file-activity report accumulate into
//! buckets keyed by the record's end time truncated to a 5-minute boundary.
//! Buckets are created on first write and never merged across slots.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeDelta, Timelike};

/// Width of one bucket in minutes.
pub const BUCKET_MINUTES: u32 = 5;

/// Width of one bucket.
#[must_use]
pub fn bucket_step() -> TimeDelta {
    TimeDelta::minutes(i64::from(BUCKET_MINUTES))
}

/// Truncates `time` to the start of its 5-minute slot.
///
/// ```
/// use chrono::NaiveDateTime;
/// use flowpulse_monitor::flow::bucket_slot;
///
/// let t: NaiveDateTime = "2023-04-17T08:57:20".parse().unwrap();
/// assert_eq!(bucket_slot(t).to_string(), "2023-04-17 08:55:00");
/// ```
#[must_use]
pub fn bucket_slot(time: NaiveDateTime) -> NaiveDateTime {
    let minute = time.minute() - time.minute() % BUCKET_MINUTES;
    time.date()
        .and_hms_opt(time.hour(), minute, 0)
        .unwrap_or(time)
}

/// A momentum-counter bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountBucket {
    pub count: i64,
    /// Forces momentum to zero once this bucket is evaluated.
    pub reset_event: bool,
}

/// An ordered map of slot start → bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline<B> {
    buckets: BTreeMap<NaiveDateTime, B>,
}

impl<B> Default for Timeline<B> {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }
}

impl<B: Default + Clone> Timeline<B> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The bucket for `time`'s slot, created empty on first access.
    pub fn slot_mut(&mut self, time: NaiveDateTime) -> &mut B {
        self.buckets.entry(bucket_slot(time)).or_default()
    }

    /// The bucket for `time`'s slot, if one exists.
    #[must_use]
    pub fn get(&self, time: NaiveDateTime) -> Option<&B> {
        self.buckets.get(&bucket_slot(time))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Start of the oldest slot held.
    #[must_use]
    pub fn first_slot(&self) -> Option<NaiveDateTime> {
        self.buckets.keys().next().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NaiveDateTime, &B)> {
        self.buckets.iter()
    }

    /// Drops every bucket whose slot starts before `earliest`.
    pub fn retain_from(&mut self, earliest: NaiveDateTime) {
        self.buckets = self.buckets.split_off(&bucket_slot(earliest));
    }

    /// Keeps only the `max` most recent buckets.
    pub fn retain_newest(&mut self, max: usize) {
        while self.buckets.len() > max {
            self.buckets.pop_first();
        }
    }

    /// Builds a fresh timeline with one bucket per slot from `start` to `now`.
    ///
    /// At most `max_slots` slots are produced (the newest ones). Buckets of
    /// `self` whose slot falls inside the new span are carried over; all other
    /// buckets are discarded.
    #[must_use]
    pub fn reconciled(&self, start: NaiveDateTime, now: NaiveDateTime, max_slots: usize) -> Self {
        let end = bucket_slot(now);
        let mut slot = bucket_slot(start);

        if max_slots == 0 {
            return Self::default();
        }
        let span = i32::try_from(max_slots - 1).unwrap_or(i32::MAX);
        let earliest = end - bucket_step() * span;
        if slot < earliest {
            slot = earliest;
        }

        let mut fresh = BTreeMap::new();
        while slot <= end {
            let bucket = self.buckets.get(&slot).cloned().unwrap_or_default();
            fresh.insert(slot, bucket);
            slot += bucket_step();
        }

        Self { buckets: fresh }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveDateTime {
        s.parse().expect("valid timestamp")
    }

    #[test]
    fn slot_truncates_to_five_minutes() {
        assert_eq!(bucket_slot(t("2023-04-17T08:57:20")), t("2023-04-17T08:55:00"));
        assert_eq!(bucket_slot(t("2023-04-17T08:55:00")), t("2023-04-17T08:55:00"));
        assert_eq!(bucket_slot(t("2023-04-17T08:59:59.900")), t("2023-04-17T08:55:00"));
        assert_eq!(bucket_slot(t("2023-04-17T00:04:00")), t("2023-04-17T00:00:00"));
    }

    #[test]
    fn buckets_are_created_lazily_per_slot() {
        let mut timeline: Timeline<CountBucket> = Timeline::new();
        timeline.slot_mut(t("2023-04-17T08:56:00")).count += 10;
        timeline.slot_mut(t("2023-04-17T08:59:00")).count += 5;
        timeline.slot_mut(t("2023-04-17T09:00:00")).count += 1;

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.get(t("2023-04-17T08:55:00")).unwrap().count, 15);
        assert_eq!(timeline.get(t("2023-04-17T09:01:00")).unwrap().count, 1);
    }

    #[test]
    fn reconcile_preserves_overlapping_buckets() {
        let mut timeline: Timeline<CountBucket> = Timeline::new();
        timeline.slot_mut(t("2023-04-17T08:10:00")).count = 99;
        timeline.slot_mut(t("2023-04-17T08:40:00")).count = 42;

        let fresh = timeline.reconciled(t("2023-04-17T08:32:00"), t("2023-04-17T08:51:00"), 24);

        assert_eq!(fresh.first_slot(), Some(t("2023-04-17T08:30:00")));
        assert_eq!(fresh.len(), 5);
        assert_eq!(fresh.get(t("2023-04-17T08:40:00")).unwrap().count, 42);
        assert!(fresh.get(t("2023-04-17T08:10:00")).is_none());
    }

    #[test]
    fn reconcile_is_bounded() {
        let timeline: Timeline<CountBucket> = Timeline::new();
        let fresh = timeline.reconciled(t("2023-04-17T00:00:00"), t("2023-04-17T08:00:00"), 24);

        assert_eq!(fresh.len(), 24);
        assert_eq!(fresh.first_slot(), Some(t("2023-04-17T06:05:00")));
    }

    #[test]
    fn retain_newest_drops_oldest() {
        let mut timeline: Timeline<CountBucket> = Timeline::new();
        for minute in [0, 5, 10, 15] {
            timeline.slot_mut(t(&format!("2023-04-17T08:{minute:02}:00"))).count = 1;
        }
        timeline.retain_newest(2);
        assert_eq!(timeline.first_slot(), Some(t("2023-04-17T08:10:00")));
    }

    #[test]
    fn retain_from_drops_older_slots() {
        let mut timeline: Timeline<CountBucket> = Timeline::new();
        timeline.slot_mut(t("2023-04-17T06:00:00")).count = 1;
        timeline.slot_mut(t("2023-04-17T08:00:00")).count = 2;
        timeline.retain_from(t("2023-04-17T07:02:00"));
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.first_slot(), Some(t("2023-04-17T08:00:00")));
    }
}
