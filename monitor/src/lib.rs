//! FlowPulse Monitor - IDE activity relay and focus momentum engine.
//!
//! Editor plugins append activity records to `<flow_dir>/<plugin>/active.flow`.
//! This crate relays those records to the flow service and computes a live
//! "momentum" score from them.
//!
//! # Overview
//!
//! For every plugin a [`agent::PluginAgent`] owns:
//!
//! - a [`watcher::PluginWatcher`] that follows the live log across renames,
//! - a [`flow::FlowStateEngine`] fed with de-duplicated records on each change,
//! - a [`pipeline::PluginPipeline`] that periodically turns the live log into
//!   bounded batch files and publishes them through a [`sender::FlowService`].
//!
//! # Modules
//!
//! - [`types`]: Activity records, flow batches, and collaborator signals
//! - [`parser`]: Line parsing and log reading
//! - [`watcher`]: Live log watcher state machine
//! - [`pipeline`]: Crash-safe commit/split/promote/publish pipeline
//! - [`flow`]: Momentum, activity state, snapshots, and file activity
//! - [`agent`]: Per-plugin actor tying the pieces together
//! - [`sender`]: Flow service trait and HTTP client with retry
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations
//! - [`utils`]: Shared utilities (debouncing)

pub mod agent;
pub mod config;
pub mod error;
pub mod flow;
pub mod parser;
pub mod pipeline;
pub mod sender;
pub mod types;
pub mod utils;
pub mod watcher;

pub use agent::{AgentConfig, AgentHandle, AgentMessage, PluginAgent};
pub use config::{Config, ConfigError};
pub use error::{MonitorError, Result};
pub use flow::{FlowStateEngine, FlowStatus, RecordDeduplicator, Snapshot};
pub use parser::{parse_line, read_flow_batch, read_log, ParseError, ReadError, ReadOutcome};
pub use pipeline::{PipelineError, PluginPipeline, PublishReport, RecoveryAction};
pub use sender::{
    FlowService, FlowStateTable, HttpFlowClient, RetryPolicy, SenderConfig, SenderError,
};
pub use types::{ActivityKind, ActivityRecord, FlowBatch, MemberState, MomentumUpdate};
pub use utils::{DebounceWindow, DEFAULT_DEBOUNCE_MS};
pub use watcher::{PluginWatcher, WatchEvent, WatchState, WatcherError};
