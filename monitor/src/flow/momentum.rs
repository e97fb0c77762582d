//! Momentum calculation over a sliding window of bucket counts.
//!
//! Buckets are evaluated oldest to newest. For each bucket the count is added
//! to the four preceding slots (20 minutes). A total above the threshold earns
//! momentum, a total below it decays momentum and counts as an idle bucket.
//! More than an hour of idle buckets, or an explicit reset event, drops
//! momentum to zero.

use std::collections::VecDeque;

/// Bucket total separating active from idle buckets.
pub const ACTIVITY_THRESHOLD: f64 = 150.0;

/// Momentum gained by an active bucket.
pub const MOMENTUM_GAIN: f64 = 5.0;

/// Momentum lost by an idle bucket.
pub const MOMENTUM_DECAY: f64 = 2.5;

/// Upper bound of the momentum score.
pub const MAX_MOMENTUM: f64 = 200.0;

/// Idle buckets tolerated before momentum resets (one hour).
pub const MAX_IDLE_BUCKETS: u32 = 12;

/// Preceding buckets summed with the current one.
pub const WINDOW_SLOTS: usize = 4;

/// Incremental momentum state.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentumCalculator {
    /// Oldest slot first.
    window: VecDeque<f64>,
    momentum: f64,
    consecutive_idle: u32,
}

impl Default for MomentumCalculator {
    fn default() -> Self {
        Self {
            window: VecDeque::from(vec![0.0; WINDOW_SLOTS]),
            momentum: 0.0,
            consecutive_idle: 0,
        }
    }
}

impl MomentumCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a known momentum and the four preceding bucket counts,
    /// given newest first.
    #[must_use]
    pub fn seeded(momentum: f64, history_newest_first: [f64; WINDOW_SLOTS]) -> Self {
        Self {
            window: history_newest_first.into_iter().rev().collect(),
            momentum: momentum.clamp(0.0, MAX_MOMENTUM),
            consecutive_idle: 0,
        }
    }

    /// Evaluates one bucket and returns the new momentum.
    pub fn step(&mut self, count: f64, reset_event: bool) -> f64 {
        let total = count + self.window.iter().sum::<f64>();

        if total > ACTIVITY_THRESHOLD {
            self.momentum += MOMENTUM_GAIN;
            self.consecutive_idle = 0;
        } else if total < ACTIVITY_THRESHOLD {
            self.momentum -= MOMENTUM_DECAY;
            self.consecutive_idle += 1;
        }
        self.momentum = self.momentum.clamp(0.0, MAX_MOMENTUM);

        if self.consecutive_idle > MAX_IDLE_BUCKETS || reset_event {
            self.momentum = 0.0;
        }

        self.window.pop_front();
        self.window.push_back(count);

        self.momentum
    }

    #[must_use]
    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    #[must_use]
    pub fn consecutive_idle(&self) -> u32 {
        self.consecutive_idle
    }

    /// Window contents, oldest first.
    #[must_use]
    pub fn window(&self) -> Vec<f64> {
        self.window.iter().copied().collect()
    }
}
