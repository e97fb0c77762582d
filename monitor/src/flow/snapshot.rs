//! Server-side flow state snapshots.
//!
//! The backend periodically reports the last momentum it computed together
//! with the bucket history leading up to it. The engine uses the snapshot to
//! seed its own recomputation when the snapshot is recent enough.
//!
//! The history arrives as a string `total [b0, b1, b2, b3, b4]`. `b0` is the
//! snapshot's own (still filling) slot, which the local timeline recounts,
//! and `b1..b4` are the four completed slots before it, newest first.

use std::collections::HashMap;

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta};
use thiserror::Error;

use crate::flow::momentum::WINDOW_SLOTS;

/// Key of the as-of timestamp in the flow state map.
pub const TIME_KEY: &str = "time";

/// Key of the momentum value in the flow state map.
pub const MOMENTUM_KEY: &str = "momentum";

/// Key of the rollover bucket history in the flow state map.
pub const HISTORY_KEY: &str = "rolloverBucketHistory";

/// Snapshots older than this are ignored when seeding.
#[must_use]
pub fn max_snapshot_age() -> TimeDelta {
    TimeDelta::hours(2)
}

/// Errors raised while reading a snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("flow state is missing key: {0}")]
    MissingKey(&'static str),

    #[error("invalid snapshot time: {0}")]
    InvalidTime(String),

    #[error("invalid momentum value: {0}")]
    InvalidMomentum(String),

    #[error("invalid rollover bucket history: {0}")]
    InvalidHistory(String),
}

/// The server's last known flow state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub time: NaiveDateTime,
    pub momentum: f64,
    /// Counts of the four slots before `time`, newest first.
    pub rollover_bucket_history: [f64; WINDOW_SLOTS],
}

impl Snapshot {
    /// Builds a snapshot from the key/value form of the flow state table.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if a key is missing or a value is malformed.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, SnapshotError> {
        let get = |key: &'static str| {
            map.get(key)
                .map(String::as_str)
                .ok_or(SnapshotError::MissingKey(key))
        };

        let time = parse_time(get(TIME_KEY)?)?;

        let raw_momentum = get(MOMENTUM_KEY)?;
        let momentum = raw_momentum
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|m| m.is_finite())
            .ok_or_else(|| SnapshotError::InvalidMomentum(raw_momentum.to_string()))?;

        let history = parse_rollover_history(get(HISTORY_KEY)?)?;

        Ok(Self {
            time,
            momentum,
            rollover_bucket_history: history.preceding,
        })
    }

    /// True if the snapshot is younger than two hours at `now`.
    #[must_use]
    pub fn is_fresh(&self, now: NaiveDateTime) -> bool {
        now - self.time < max_snapshot_age()
    }
}

/// Parsed form of a `total [b0, ...]` history string.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloverHistory {
    pub total: f64,
    /// The snapshot's own slot, when present.
    pub current: Option<f64>,
    /// The four preceding slots, newest first.
    pub preceding: [f64; WINDOW_SLOTS],
}

/// Parses `total [b0, b1, b2, b3, b4]`.
///
/// Values may be separated by commas, spaces, or both. Five values are read
/// as the current slot followed by four preceding slots; four values are read
/// as the preceding slots alone.
///
/// # Errors
///
/// Returns [`SnapshotError::InvalidHistory`] for any other shape.
///
/// ```
/// use flowpulse_monitor::flow::parse_rollover_history;
///
/// let history = parse_rollover_history("310.0 [20.0, 90.0, 100.0, 60.0, 40.0]").unwrap();
/// assert_eq!(history.current, Some(20.0));
/// assert_eq!(history.preceding, [90.0, 100.0, 60.0, 40.0]);
/// ```
pub fn parse_rollover_history(raw: &str) -> Result<RolloverHistory, SnapshotError> {
    let invalid = || SnapshotError::InvalidHistory(raw.to_string());

    let (total_part, rest) = raw.trim().split_once('[').ok_or_else(invalid)?;
    let inner = rest.trim_end().strip_suffix(']').ok_or_else(invalid)?;

    let total = total_part.trim().parse::<f64>().map_err(|_| invalid())?;

    let values = inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    if !total.is_finite() || values.iter().any(|v| !v.is_finite()) {
        return Err(invalid());
    }

    let (current, preceding) = match values.len() {
        5 => (Some(values[0]), &values[1..]),
        4 => (None, &values[..]),
        _ => return Err(invalid()),
    };

    let mut slots = [0.0; WINDOW_SLOTS];
    slots.copy_from_slice(preceding);

    Ok(RolloverHistory {
        total,
        current,
        preceding: slots,
    })
}

/// Accepts a naive local timestamp or an RFC 3339 timestamp.
fn parse_time(raw: &str) -> Result<NaiveDateTime, SnapshotError> {
    let raw = raw.trim();
    if let Ok(naive) = raw.parse::<NaiveDateTime>() {
        return Ok(naive);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Local).naive_local())
        .map_err(|_| SnapshotError::InvalidTime(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn parses_full_snapshot() {
        let snapshot = Snapshot::from_map(&map(&[
            ("time", "2023-04-17T08:30:00"),
            ("momentum", "42.5"),
            ("rolloverBucketHistory", "250 [10, 50, 60, 70, 60]"),
        ]))
        .unwrap();

        assert_eq!(snapshot.time.to_string(), "2023-04-17 08:30:00");
        assert_eq!(snapshot.momentum, 42.5);
        assert_eq!(snapshot.rollover_bucket_history, [50.0, 60.0, 70.0, 60.0]);
    }

    #[test]
    fn missing_key_is_reported() {
        let err = Snapshot::from_map(&map(&[("time", "2023-04-17T08:30:00")])).unwrap_err();
        assert_eq!(err, SnapshotError::MissingKey(MOMENTUM_KEY));
    }

    #[test]
    fn bad_momentum_is_reported() {
        let err = Snapshot::from_map(&map(&[
            ("time", "2023-04-17T08:30:00"),
            ("momentum", "lots"),
            ("rolloverBucketHistory", "0 [0, 0, 0, 0]"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidMomentum(_)));
    }

    #[test]
    fn non_finite_momentum_is_rejected() {
        for raw in ["NaN", "inf", "-infinity"] {
            let err = Snapshot::from_map(&map(&[
                ("time", "2023-04-17T08:30:00"),
                ("momentum", raw),
                ("rolloverBucketHistory", "0 [0, 0, 0, 0]"),
            ]))
            .unwrap_err();
            assert_eq!(err, SnapshotError::InvalidMomentum(raw.to_string()));
        }
    }

    #[test]
    fn non_finite_history_is_rejected() {
        assert!(parse_rollover_history("NaN [1, 2, 3, 4]").is_err());
        assert!(parse_rollover_history("10 [1, NaN, 3, 4]").is_err());
        assert!(parse_rollover_history("10 [0, 1, 2, inf, 4]").is_err());
    }

    #[test]
    fn history_accepts_space_separated_values() {
        let history = parse_rollover_history("4.5 [0.5 1 1.5 0.5 1]").unwrap();
        assert_eq!(history.total, 4.5);
        assert_eq!(history.preceding, [1.0, 1.5, 0.5, 1.0]);
    }

    #[test]
    fn history_with_four_values_has_no_current_slot() {
        let history = parse_rollover_history("10 [1, 2, 3, 4]").unwrap();
        assert_eq!(history.current, None);
        assert_eq!(history.preceding, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn malformed_history_is_rejected() {
        assert!(parse_rollover_history("10 1, 2, 3, 4").is_err());
        assert!(parse_rollover_history("10 [1, 2, 3]").is_err());
        assert!(parse_rollover_history("ten [1, 2, 3, 4]").is_err());
        assert!(parse_rollover_history("10 [1, x, 3, 4]").is_err());
    }

    #[test]
    fn freshness_window_is_two_hours() {
        let snapshot = Snapshot {
            time: "2023-04-17T08:00:00".parse().unwrap(),
            momentum: 0.0,
            rollover_bucket_history: [0.0; 4],
        };
        assert!(snapshot.is_fresh("2023-04-17T09:59:00".parse().unwrap()));
        assert!(!snapshot.is_fresh("2023-04-17T10:00:00".parse().unwrap()));
    }

    #[test]
    fn rfc3339_time_is_accepted() {
        assert!(parse_time("2023-04-17T08:30:00Z").is_ok());
        assert!(parse_time("yesterday").is_err());
    }
}
