//! Debounce window for coalescing bursts of file system events.
//!
//! Editors and plugins often flush a log in several small writes. Each write
//! produces its own notify event, but a single read after the burst is enough.
//! [`DebounceWindow`] tracks one pending deadline: every new event pushes the
//! deadline out by the interval, and the owner fires once the deadline passes
//! with no further events.
//!
//! The window holds no task of its own. It is meant to be polled from an
//! existing `tokio::select!` loop:
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use flowpulse_monitor::utils::debounce::DebounceWindow;
//!
//! # async fn example(mut rx: tokio::sync::mpsc::Receiver<()>) {
//! let mut window = DebounceWindow::new(Duration::from_millis(100));
//! loop {
//!     tokio::select! {
//!         Some(()) = rx.recv() => window.touch(Instant::now()),
//!         _ = window.wait() => {
//!             if window.take_due(Instant::now()) {
//!                 // read the file once for the whole burst
//!             }
//!         }
//!     }
//! }
//! # }
//! ```

use std::time::Duration;

use tokio::time::Instant;

/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// A single-key debounce deadline.
#[derive(Debug, Clone)]
pub struct DebounceWindow {
    interval: Duration,
    deadline: Option<Instant>,
}

impl DebounceWindow {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Creates a window with the default 100ms interval.
    #[must_use]
    pub fn with_default_interval() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DEBOUNCE_MS))
    }

    /// Records an event at `now`, (re)starting the quiet period.
    pub fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    /// Returns true if an event is waiting for its quiet period to end.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// The instant the pending event becomes due, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clears the pending event without firing it.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Consumes the pending event if its deadline has passed.
    ///
    /// Returns true exactly once per burst.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Sleeps until the pending deadline. Never completes when idle.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for DebounceWindow {
    fn default() -> Self {
        Self::with_default_interval()
    }
}
