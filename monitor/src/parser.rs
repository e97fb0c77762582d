//! Log reader for FlowPulse plugin activity logs.
//!
//! Plugins write one record per line:
//!
//! ```text
//! ModificationActivity={"durationInSeconds":30,"endTime":"2023-04-17T08:57:20","modificationCount":200}
//! ```
//!
//! The text before the first `=` selects the record kind and the rest is the
//! JSON payload. [`parse_line`] turns one line into an [`ActivityRecord`];
//! [`read_log`] streams a whole file through a callback, collecting per-line
//! failures without giving up on the remaining lines.
//!
//! # Example
//!
//! ```
//! use flowpulse_monitor::parser::parse_line;
//! use flowpulse_monitor::types::ActivityKind;
//!
//! let line = r#"ExternalActivity={"durationInSeconds":60,"endTime":"2023-04-17T09:00:00"}"#;
//! let record = parse_line(line).unwrap();
//! assert_eq!(record.kind(), ActivityKind::ExternalActivity);
//! ```

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::types::{ActivityKind, ActivityRecord, FlowBatch};

/// Errors produced while parsing a single log line.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The line has no `=` separating tag and payload.
    #[error("missing '=' between tag and payload")]
    MissingSeparator,

    /// The tag is not one of the known record kinds.
    #[error("unknown record tag: {0}")]
    UnknownTag(String),

    /// The payload is not valid JSON for the tag, or a required field is absent.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: ActivityKind,
        #[source]
        source: serde_json::Error,
    },
}

/// A line that could not be parsed, with its 1-based line number.
#[derive(Debug)]
pub struct LineFailure {
    pub line_number: usize,
    pub error: ParseError,
}

/// Result of streaming a whole log file.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Number of records handed to the callback.
    pub records: usize,
    /// Lines that failed to parse; the scan continued past each of them.
    pub failures: Vec<LineFailure>,
    /// Set when the file could not be opened or streamed to the end.
    pub io_error: Option<std::io::Error>,
}

impl ReadOutcome {
    /// True when every line parsed and the file was read to the end.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.failures.is_empty() && self.io_error.is_none()
    }
}

/// Parses one log line into an activity record.
///
/// # Errors
///
/// Returns [`ParseError`] for a missing separator, an unknown tag, malformed
/// JSON, or a payload missing a required field.
pub fn parse_line(line: &str) -> Result<ActivityRecord, ParseError> {
    let (tag, payload) = line.split_once('=').ok_or(ParseError::MissingSeparator)?;
    let kind: ActivityKind = tag.trim().parse().map_err(ParseError::UnknownTag)?;

    let invalid = |source| ParseError::InvalidPayload { kind, source };

    let record = match kind {
        ActivityKind::EditorActivity => {
            ActivityRecord::Editor(serde_json::from_str(payload).map_err(invalid)?)
        }
        ActivityKind::ExecutionActivity => {
            ActivityRecord::Execution(serde_json::from_str(payload).map_err(invalid)?)
        }
        ActivityKind::ModificationActivity => {
            ActivityRecord::Modification(serde_json::from_str(payload).map_err(invalid)?)
        }
        ActivityKind::ExternalActivity => {
            ActivityRecord::External(serde_json::from_str(payload).map_err(invalid)?)
        }
        ActivityKind::Event => {
            ActivityRecord::Event(serde_json::from_str(payload).map_err(invalid)?)
        }
    };

    Ok(record)
}

/// Streams `path` line by line, handing every parsed record to `on_record`.
///
/// Blank lines are skipped. A line that fails to parse is recorded in the
/// outcome and the scan moves on, so one bad line never loses its siblings.
/// The file is fully read and closed before this returns.
pub async fn read_log<A, F>(path: &Path, acc: &mut A, mut on_record: F) -> ReadOutcome
where
    F: FnMut(&mut A, ActivityKind, ActivityRecord),
{
    let mut outcome = ReadOutcome::default();

    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to open log file");
            outcome.io_error = Some(e);
            return outcome;
        }
    };

    let mut lines = BufReader::new(file).lines();
    let mut line_number = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Error streaming log file");
                outcome.io_error = Some(e);
                break;
            }
        };
        line_number += 1;

        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line) {
            Ok(record) => {
                outcome.records += 1;
                on_record(acc, record.kind(), record);
            }
            Err(error) => {
                warn!(
                    path = %path.display(),
                    line_number,
                    error = %error,
                    "Failed to parse log line"
                );
                outcome.failures.push(LineFailure { line_number, error });
            }
        }
    }

    outcome
}

/// Errors returned when a batch file cannot be turned into a [`FlowBatch`].
#[derive(Error, Debug)]
pub enum ReadError {
    /// The batch file could not be opened or read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One or more lines failed to parse.
    #[error("{path} has {count} unparseable line(s), first at line {first_line}: {first_error}")]
    Unparseable {
        path: PathBuf,
        count: usize,
        first_line: usize,
        first_error: String,
    },
}

/// Reads a whole batch file into a [`FlowBatch`].
///
/// # Errors
///
/// Fails if the file cannot be read or if any line is unparseable; a batch is
/// never partially salvaged.
pub async fn read_flow_batch(path: &Path, plugin_id: &str) -> Result<FlowBatch, ReadError> {
    let batch_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut batch = FlowBatch::new(plugin_id, &batch_name);

    let outcome = read_log(path, &mut batch, |batch, _kind, record| batch.push(record)).await;

    if let Some(source) = outcome.io_error {
        return Err(ReadError::Io {
            path: path.to_path_buf(),
            source,
        });
    }

    if let Some(first) = outcome.failures.first() {
        return Err(ReadError::Unparseable {
            path: path.to_path_buf(),
            count: outcome.failures.len(),
            first_line: first.line_number,
            first_error: first.error.to_string(),
        });
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const MODIFICATION: &str = r#"ModificationActivity={"durationInSeconds":30,"endTime":"2023-04-17T08:57:20","modificationCount":200}"#;
    const EDITOR: &str = r#"EditorActivity={"durationInSeconds":45,"endTime":"2023-04-17T08:58:00","module":"core","filePath":"src/lib.rs","isModified":true}"#;
    const EXECUTION: &str = r#"ExecutionActivity={"processName":"cargo test","durationInSeconds":12,"endTime":"2023-04-17T08:59:00","exitCode":0,"taskType":"test","isDebug":false}"#;
    const EXTERNAL: &str = r#"ExternalActivity={"durationInSeconds":120,"endTime":"2023-04-17T09:01:00","comment":"docs"}"#;
    const EVENT: &str = r#"Event={"comment":"switched branch","type":"NOTE","position":"2023-04-17T09:02:00"}"#;

    fn write_log(dir: &TempDir, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("Failed to create file");
        for line in lines {
            writeln!(file, "{line}").expect("Failed to write line");
        }
        path
    }

    #[test]
    fn parses_every_kind() {
        assert_eq!(parse_line(MODIFICATION).unwrap().kind(), ActivityKind::ModificationActivity);
        assert_eq!(parse_line(EDITOR).unwrap().kind(), ActivityKind::EditorActivity);
        assert_eq!(parse_line(EXECUTION).unwrap().kind(), ActivityKind::ExecutionActivity);
        assert_eq!(parse_line(EXTERNAL).unwrap().kind(), ActivityKind::ExternalActivity);
        assert_eq!(parse_line(EVENT).unwrap().kind(), ActivityKind::Event);
    }

    #[test]
    fn modification_fields_are_read() {
        let ActivityRecord::Modification(m) = parse_line(MODIFICATION).unwrap() else {
            panic!("expected a modification record");
        };
        assert_eq!(m.duration_in_seconds, 30);
        assert_eq!(m.modification_count, 200);
        assert_eq!(m.end_time.to_string(), "2023-04-17 08:57:20");
    }

    #[test]
    fn payload_may_contain_equals_signs() {
        let line = r#"ExternalActivity={"durationInSeconds":1,"endTime":"2023-04-17T09:01:00","comment":"a=b"}"#;
        let ActivityRecord::External(e) = parse_line(line).unwrap() else {
            panic!("expected an external record");
        };
        assert_eq!(e.comment.as_deref(), Some("a=b"));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = parse_line(r#"Heartbeat={"durationInSeconds":1}"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownTag(ref t) if t == "Heartbeat"));
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(matches!(
            parse_line("EditorActivity").unwrap_err(),
            ParseError::MissingSeparator
        ));
    }

    #[test]
    fn missing_duration_is_rejected() {
        let line = r#"EditorActivity={"endTime":"2023-04-17T08:58:00","filePath":"a.rs"}"#;
        let err = parse_line(line).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidPayload { kind: ActivityKind::EditorActivity, .. }
        ));
        assert!(err.to_string().contains("durationInSeconds"));
    }

    #[test]
    fn event_without_position_is_rejected() {
        let err = parse_line(r#"Event={"comment":"x","type":"NOTE"}"#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidPayload { kind: ActivityKind::Event, .. }));
    }

    #[tokio::test]
    async fn malformed_line_marks_file_unsuccessful_but_keeps_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut lines = vec![MODIFICATION; 5];
        lines.push("EditorActivity={bad json");
        lines.extend([EDITOR; 5]);
        let path = write_log(&dir, "mixed.flow", &lines);

        let mut seen = Vec::new();
        let outcome = read_log(&path, &mut seen, |seen, kind, _| seen.push(kind)).await;

        assert!(!outcome.is_successful());
        assert_eq!(outcome.records, 10);
        assert_eq!(seen.len(), 10);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].line_number, 6);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "blank.flow", &[MODIFICATION, "", "   ", EVENT]);

        let mut count = 0usize;
        let outcome = read_log(&path, &mut count, |count, _, _| *count += 1).await;

        assert!(outcome.is_successful());
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn missing_file_is_unsuccessful() {
        let dir = tempfile::tempdir().unwrap();
        let mut count = 0usize;
        let outcome = read_log(&dir.path().join("nope.flow"), &mut count, |c, _, _| *c += 1).await;

        assert!(!outcome.is_successful());
        assert!(outcome.io_error.is_some());
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn valid_batch_populates_every_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            &dir,
            "batch_1.flow",
            &[MODIFICATION, EDITOR, EXECUTION, EXTERNAL, EVENT, MODIFICATION],
        );

        let batch = read_flow_batch(&path, "intellij").await.unwrap();

        assert_eq!(batch.modification_activity.len(), 2);
        assert_eq!(batch.editor_activity.len(), 1);
        assert_eq!(batch.execution_activity.len(), 1);
        assert_eq!(batch.external_activity.len(), 1);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.editor_activity[0].file_path.as_deref(), Some("src/lib.rs"));
        assert!(batch.time_sent.is_none());
    }

    #[tokio::test]
    async fn unparseable_batch_is_not_salvaged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "batch_2.flow", &[MODIFICATION, "Nope={}", EDITOR]);

        let err = read_flow_batch(&path, "intellij").await.unwrap_err();
        assert!(matches!(err, ReadError::Unparseable { count: 1, first_line: 2, .. }));
    }
}
