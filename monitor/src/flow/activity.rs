//! IDLE/FLOW activity state with streak tracking.

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

/// A gap longer than this between activity records starts a new streak.
#[must_use]
pub fn streak_gap() -> TimeDelta {
    TimeDelta::minutes(60)
}

/// Time without activity after which the idle check moves to `Idle`.
#[must_use]
pub fn idle_timeout() -> TimeDelta {
    TimeDelta::minutes(30)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    #[default]
    Idle,
    Flow,
}

/// Tracks whether the developer is currently in flow and since when.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityTracker {
    state: ActivityState,
    last_activity_event: Option<NaiveDateTime>,
    streak_start: Option<NaiveDateTime>,
}

impl ActivityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ActivityState {
        self.state
    }

    #[must_use]
    pub fn last_activity_event(&self) -> Option<NaiveDateTime> {
        self.last_activity_event
    }

    #[must_use]
    pub fn streak_start(&self) -> Option<NaiveDateTime> {
        self.streak_start
    }

    /// Registers an editing record that ended at `time`.
    pub fn record_activity(&mut self, time: NaiveDateTime) {
        let gap_exceeded = self
            .last_activity_event
            .is_some_and(|last| time - last > streak_gap());

        if gap_exceeded || self.streak_start.is_none() {
            self.streak_start = Some(time);
        }

        self.last_activity_event = Some(match self.last_activity_event {
            Some(last) if last > time => last,
            _ => time,
        });
        self.state = ActivityState::Flow;
    }

    /// Moves to `Idle` when nothing happened for 30 minutes.
    ///
    /// Returns true if the state changed.
    pub fn check_idle(&mut self, now: NaiveDateTime) -> bool {
        let stale = match self.last_activity_event {
            Some(last) => now - last > idle_timeout(),
            None => true,
        };

        if stale && self.state == ActivityState::Flow {
            self.state = ActivityState::Idle;
            self.streak_start = None;
            return true;
        }
        false
    }

    /// Ends the current streak; the next record starts a new one.
    pub fn clear_streak(&mut self) {
        self.streak_start = None;
    }
}
