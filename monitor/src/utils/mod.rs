//! Utility modules for the FlowPulse monitor.
//!
//! - [`debounce`]: Debounce window for coalescing rapid file system events

pub mod debounce;

pub use debounce::{DebounceWindow, DEFAULT_DEBOUNCE_MS};
