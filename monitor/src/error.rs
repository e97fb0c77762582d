//! Error types for the FlowPulse Monitor.
//!
//! Each module defines its own error enum next to the code that raises it.
//! [`MonitorError`] gathers them for callers that drive several modules at
//! once, such as the plugin agent and the binary.

use thiserror::Error;

use crate::config::ConfigError;
use crate::flow::SnapshotError;
use crate::parser::{ParseError, ReadError};
use crate::pipeline::PipelineError;
use crate::sender::SenderError;
use crate::watcher::WatcherError;

/// Errors that can occur during monitor operations.
///
/// This is the primary error type for the monitor crate, encompassing all
/// possible failure modes.
///
/// # Examples
///
/// ```
/// use flowpulse_monitor::error::{MonitorError, Result};
/// use flowpulse_monitor::parser::parse_line;
///
/// fn first_record(line: &str) -> Result<()> {
///     parse_line(line)?;
///     Ok(())
/// }
///
/// assert!(matches!(first_record("nonsense"), Err(MonitorError::Parse(_))));
/// ```
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A log line could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A batch file could not be read.
    #[error("read error: {0}")]
    Read(#[from] ReadError),

    /// File watching error.
    #[error("file watch error: {0}")]
    Watch(#[from] WatcherError),

    /// A pipeline stage failed.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// The flow service could not be reached or rejected a request.
    #[error("flow service error: {0}")]
    Sender(#[from] SenderError),

    /// The server's flow state could not be interpreted.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The plugin agent has stopped.
    #[error("agent for plugin {0} has stopped")]
    AgentStopped(String),
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
