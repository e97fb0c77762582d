//! Flow state engine: live momentum, activity state, and file activity.
//!
//! The engine owns two bucket timelines for a single plugin:
//!
//! - a momentum counter timeline fed by modification counts, and
//! - a file-activity timeline fed by editor records.
//!
//! Momentum is recomputed from the counter timeline after every new record
//! and every snapshot refresh, seeded from the server snapshot when it is
//! less than two hours old. Only changes in the computed value are reported
//! outward as [`MomentumUpdate`]s.
//!
//! All methods take `now` explicitly so callers (and tests) control the clock.
//!
//! # Example
//!
//! ```
//! use flowpulse_monitor::flow::FlowStateEngine;
//! use flowpulse_monitor::parser::parse_line;
//!
//! let mut engine = FlowStateEngine::new("intellij", false);
//! let record = parse_line(
//!     r#"ModificationActivity={"durationInSeconds":30,"endTime":"2023-04-17T08:57:20","modificationCount":200}"#,
//! ).unwrap();
//!
//! let update = engine.ingest([record], "2023-04-17T08:58:00".parse().unwrap());
//! assert_eq!(update.map(|u| u.momentum), Some(5.0));
//! ```

mod activity;
mod bucket;
mod dedup;
mod file_activity;
mod momentum;
mod snapshot;

pub use activity::{idle_timeout, streak_gap, ActivityState, ActivityTracker};
pub use bucket::{bucket_slot, bucket_step, CountBucket, Timeline, BUCKET_MINUTES};
pub use dedup::RecordDeduplicator;
pub use file_activity::{
    FileActivityEntry, FileActivitySummary, FileActivityTimeline, MAX_FILE_ACTIVITY_BUCKETS,
};
pub use momentum::{
    MomentumCalculator, ACTIVITY_THRESHOLD, MAX_IDLE_BUCKETS, MAX_MOMENTUM, MOMENTUM_DECAY,
    MOMENTUM_GAIN, WINDOW_SLOTS,
};
pub use snapshot::{
    max_snapshot_age, parse_rollover_history, RolloverHistory, Snapshot, SnapshotError,
    HISTORY_KEY, MOMENTUM_KEY, TIME_KEY,
};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{ActivityRecord, MemberState, MomentumUpdate};

/// Momentum buckets retained (two hours).
pub const MOMENTUM_WINDOW_BUCKETS: usize = 24;

/// Raw count credited when a new intention is set on the same task.
pub const INTENTION_CREDIT: i64 = 500;

/// Serializable view of the engine for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatus {
    pub plugin_id: String,
    pub momentum: f64,
    pub activity_state: ActivityState,
    pub streak_start: Option<NaiveDateTime>,
    pub last_activity_event: Option<NaiveDateTime>,
    pub snapshot_time: Option<NaiveDateTime>,
    pub consecutive_idle_buckets: u32,
}

/// Per-plugin flow state.
#[derive(Debug, Clone)]
pub struct FlowStateEngine {
    plugin_id: String,
    counts: Timeline<CountBucket>,
    files: FileActivityTimeline,
    activity: ActivityTracker,
    snapshot: Option<Snapshot>,
    member_state: Option<MemberState>,
    momentum: f64,
    consecutive_idle: u32,
    last_broadcast: Option<f64>,
    intention_credit: bool,
}

impl FlowStateEngine {
    /// Creates an empty engine. `intention_credit` enables the momentum
    /// credit for a new intention on the same task.
    #[must_use]
    pub fn new(plugin_id: impl Into<String>, intention_credit: bool) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            counts: Timeline::new(),
            files: FileActivityTimeline::new(),
            activity: ActivityTracker::new(),
            snapshot: None,
            member_state: None,
            momentum: 0.0,
            consecutive_idle: 0,
            last_broadcast: None,
            intention_credit,
        }
    }

    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    #[must_use]
    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    #[must_use]
    pub fn consecutive_idle(&self) -> u32 {
        self.consecutive_idle
    }

    #[must_use]
    pub fn activity_state(&self) -> ActivityState {
        self.activity.state()
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// The momentum bucket for `time`'s slot, if one exists.
    #[must_use]
    pub fn bucket(&self, time: NaiveDateTime) -> Option<&CountBucket> {
        self.counts.get(time)
    }

    /// Feeds newly read records and recomputes momentum.
    ///
    /// Returns an update if the momentum differs from the last one reported.
    pub fn ingest<I>(&mut self, records: I, now: NaiveDateTime) -> Option<MomentumUpdate>
    where
        I: IntoIterator<Item = ActivityRecord>,
    {
        let mut touched = false;
        for record in records {
            touched |= self.accumulate(&record);
        }

        if touched {
            self.refresh(now)
        } else {
            None
        }
    }

    /// Applies one record to the timelines. Returns true if it mattered.
    fn accumulate(&mut self, record: &ActivityRecord) -> bool {
        match record {
            ActivityRecord::Modification(m) => {
                self.counts.slot_mut(m.end_time).count += i64::from(m.modification_count);
                self.activity.record_activity(m.end_time);
                true
            }
            ActivityRecord::Editor(e) => {
                if let Some(file_path) = &e.file_path {
                    self.files.record(
                        e.end_time,
                        FileActivityEntry {
                            module: e.module.clone().unwrap_or_default(),
                            file_path: file_path.clone(),
                            duration_seconds: e.duration_in_seconds,
                        },
                    );
                }
                self.activity.record_activity(e.end_time);
                true
            }
            ActivityRecord::Execution(_)
            | ActivityRecord::External(_)
            | ActivityRecord::Event(_) => false,
        }
    }

    /// Replaces the server snapshot and reconciles the counter timeline.
    ///
    /// The timeline is rebuilt from the snapshot's slot up to `now` (at most
    /// two hours); buckets accumulated locally in that span are kept.
    ///
    /// A snapshot stamped after `now` (server clock ahead) is treated as
    /// taken at `now`.
    pub fn apply_snapshot(
        &mut self,
        mut snapshot: Snapshot,
        now: NaiveDateTime,
    ) -> Option<MomentumUpdate> {
        if bucket_slot(snapshot.time) > bucket_slot(now) {
            warn!(
                plugin_id = %self.plugin_id,
                snapshot_time = %snapshot.time,
                now = %now,
                "Snapshot is ahead of the local clock, clamping to now"
            );
            snapshot.time = now;
        }
        debug!(
            plugin_id = %self.plugin_id,
            snapshot_time = %snapshot.time,
            momentum = snapshot.momentum,
            "Applying flow state snapshot"
        );
        self.counts = self
            .counts
            .reconciled(snapshot.time, now, MOMENTUM_WINDOW_BUCKETS);
        self.snapshot = Some(snapshot);
        self.refresh(now)
    }

    /// Handles a member-state broadcast.
    ///
    /// A different active task resets momentum. A new intention on the same
    /// task earns a fixed credit when enabled.
    pub fn update_member_state(
        &mut self,
        state: MemberState,
        now: NaiveDateTime,
    ) -> Option<MomentumUpdate> {
        let previous = self.member_state.replace(state.clone());
        let Some(previous) = previous else {
            return None;
        };

        if previous.active_task_id != state.active_task_id {
            info!(
                plugin_id = %self.plugin_id,
                from = ?previous.active_task_id,
                to = ?state.active_task_id,
                "Task switch, resetting momentum"
            );
            self.reset(now);
            return self.refresh(now);
        }

        if self.intention_credit && previous.working_on != state.working_on {
            debug!(plugin_id = %self.plugin_id, "New intention, crediting momentum");
            self.counts.slot_mut(now).count += INTENTION_CREDIT;
            return self.refresh(now);
        }

        None
    }

    /// Resets momentum after an external troubleshooting alert.
    pub fn troubleshooting_threshold_exceeded(
        &mut self,
        now: NaiveDateTime,
    ) -> Option<MomentumUpdate> {
        info!(
            plugin_id = %self.plugin_id,
            "Troubleshooting threshold exceeded, resetting momentum"
        );
        self.reset(now);
        self.refresh(now)
    }

    /// Moves to IDLE after 30 quiet minutes. Returns true on a state change.
    pub fn check_idle(&mut self, now: NaiveDateTime) -> bool {
        let changed = self.activity.check_idle(now);
        if changed {
            debug!(plugin_id = %self.plugin_id, "Activity state is now IDLE");
        }
        changed
    }

    /// Recomputes momentum for `now` and reports it if it changed.
    pub fn refresh(&mut self, now: NaiveDateTime) -> Option<MomentumUpdate> {
        let momentum = self.recompute(now);
        if self.last_broadcast == Some(momentum) {
            return None;
        }
        self.last_broadcast = Some(momentum);
        Some(MomentumUpdate {
            plugin_id: self.plugin_id.clone(),
            momentum,
            time: now,
        })
    }

    /// Recomputes momentum from the counter timeline without reporting.
    pub fn recompute(&mut self, now: NaiveDateTime) -> f64 {
        let now_slot = bucket_slot(now);
        let span = i32::try_from(MOMENTUM_WINDOW_BUCKETS - 1).unwrap_or(i32::MAX);
        let earliest = now_slot - bucket_step() * span;
        self.counts.retain_from(earliest);

        let (mut calculator, mut slot) = match self.snapshot.as_ref().filter(|s| s.is_fresh(now)) {
            Some(snapshot) => (
                MomentumCalculator::seeded(snapshot.momentum, snapshot.rollover_bucket_history),
                bucket_slot(snapshot.time).max(earliest),
            ),
            None => (
                MomentumCalculator::new(),
                self.counts.first_slot().unwrap_or(now_slot),
            ),
        };

        while slot <= now_slot {
            let (count, reset_event) = self
                .counts
                .get(slot)
                .map_or((0, false), |b| (b.count, b.reset_event));
            calculator.step(count as f64, reset_event);
            slot += bucket_step();
        }

        self.momentum = calculator.momentum();
        self.consecutive_idle = calculator.consecutive_idle();
        self.momentum
    }

    /// Files edited recently, longest total first.
    #[must_use]
    pub fn file_activity_report(&self) -> Vec<FileActivitySummary> {
        self.files.report()
    }

    #[must_use]
    pub fn status(&self) -> FlowStatus {
        FlowStatus {
            plugin_id: self.plugin_id.clone(),
            momentum: self.momentum,
            activity_state: self.activity.state(),
            streak_start: self.activity.streak_start(),
            last_activity_event: self.activity.last_activity_event(),
            snapshot_time: self.snapshot.as_ref().map(|s| s.time),
            consecutive_idle_buckets: self.consecutive_idle,
        }
    }

    fn reset(&mut self, now: NaiveDateTime) {
        self.counts.slot_mut(now).reset_event = true;
        self.activity.clear_streak();
    }
}
