//! Activity record types for FlowPulse plugin logs.
//!
//! IDE plugins append one record per line to their live log as
//! `<Tag>={json}`. Each tag maps to exactly one [`ActivityRecord`] variant and
//! all payload fields use camelCase JSON names.
//!
//! Timestamps are the plugin's local wall-clock time without an offset
//! (`2023-04-17T08:57:20`), so they are kept as [`NaiveDateTime`].

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five record kinds a plugin may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    EditorActivity,
    ExecutionActivity,
    ModificationActivity,
    ExternalActivity,
    Event,
}

impl ActivityKind {
    /// Every kind, in the order batch lists are laid out.
    pub const ALL: [ActivityKind; 5] = [
        ActivityKind::EditorActivity,
        ActivityKind::ExecutionActivity,
        ActivityKind::ModificationActivity,
        ActivityKind::ExternalActivity,
        ActivityKind::Event,
    ];

    /// The tag written before `=` on a log line.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            ActivityKind::EditorActivity => "EditorActivity",
            ActivityKind::ExecutionActivity => "ExecutionActivity",
            ActivityKind::ModificationActivity => "ModificationActivity",
            ActivityKind::ExternalActivity => "ExternalActivity",
            ActivityKind::Event => "Event",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityKind::ALL
            .into_iter()
            .find(|kind| kind.tag() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Time spent editing a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorActivity {
    pub duration_in_seconds: u64,
    pub end_time: NaiveDateTime,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub is_modified: bool,
}

/// A build, test, or run process launched from the IDE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionActivity {
    #[serde(default)]
    pub process_name: Option<String>,
    pub duration_in_seconds: u64,
    pub end_time: NaiveDateTime,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub is_debug: bool,
}

/// Number of edits made over an interval. Drives the momentum counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationActivity {
    pub duration_in_seconds: u64,
    pub end_time: NaiveDateTime,
    #[serde(default)]
    pub modification_count: u32,
}

/// Time spent outside the IDE (browser, docs, meetings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalActivity {
    pub duration_in_seconds: u64,
    pub end_time: NaiveDateTime,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A point-in-time marker such as a caret jump or a session boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    pub position: NaiveDateTime,
}

/// One parsed line of a plugin log.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityRecord {
    Editor(EditorActivity),
    Execution(ExecutionActivity),
    Modification(ModificationActivity),
    External(ExternalActivity),
    Event(FlowEvent),
}

impl ActivityRecord {
    #[must_use]
    pub fn kind(&self) -> ActivityKind {
        match self {
            ActivityRecord::Editor(_) => ActivityKind::EditorActivity,
            ActivityRecord::Execution(_) => ActivityKind::ExecutionActivity,
            ActivityRecord::Modification(_) => ActivityKind::ModificationActivity,
            ActivityRecord::External(_) => ActivityKind::ExternalActivity,
            ActivityRecord::Event(_) => ActivityKind::Event,
        }
    }

    /// When the record ended. Events use their `position`.
    #[must_use]
    pub fn end_time(&self) -> NaiveDateTime {
        match self {
            ActivityRecord::Editor(a) => a.end_time,
            ActivityRecord::Execution(a) => a.end_time,
            ActivityRecord::Modification(a) => a.end_time,
            ActivityRecord::External(a) => a.end_time,
            ActivityRecord::Event(e) => e.position,
        }
    }
}

/// All records of one batch file, ready to publish.
///
/// Built empty and appended to while the batch file is scanned. The
/// `batch_id` is derived from the batch file name so a resend of the same file
/// always carries the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowBatch {
    pub batch_id: Uuid,
    pub time_sent: Option<NaiveDateTime>,
    pub editor_activity: Vec<EditorActivity>,
    pub execution_activity: Vec<ExecutionActivity>,
    pub modification_activity: Vec<ModificationActivity>,
    pub external_activity: Vec<ExternalActivity>,
    pub events: Vec<FlowEvent>,
}

/// Namespace for deterministic batch ids.
const BATCH_NAMESPACE: Uuid = Uuid::from_bytes([
    0x66, 0x6c, 0x6f, 0x77, // "flow"
    0x70, 0x75, 0x6c, 0x73, // "puls"
    0x65, 0x2d, 0x62, 0x61, // "e-ba"
    0x74, 0x63, 0x68, 0x73, // "tchs"
]);

impl FlowBatch {
    /// Creates an empty batch identified by plugin and batch file name.
    #[must_use]
    pub fn new(plugin_id: &str, batch_name: &str) -> Self {
        let key = format!("{plugin_id}/{batch_name}");
        Self {
            batch_id: Uuid::new_v5(&BATCH_NAMESPACE, key.as_bytes()),
            time_sent: None,
            editor_activity: Vec::new(),
            execution_activity: Vec::new(),
            modification_activity: Vec::new(),
            external_activity: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Appends a record to the list for its kind.
    pub fn push(&mut self, record: ActivityRecord) {
        match record {
            ActivityRecord::Editor(a) => self.editor_activity.push(a),
            ActivityRecord::Execution(a) => self.execution_activity.push(a),
            ActivityRecord::Modification(a) => self.modification_activity.push(a),
            ActivityRecord::External(a) => self.external_activity.push(a),
            ActivityRecord::Event(e) => self.events.push(e),
        }
    }

    /// Total number of records across all lists.
    #[must_use]
    pub fn len(&self) -> usize {
        self.editor_activity.len()
            + self.execution_activity.len()
            + self.modification_activity.len()
            + self.external_activity.len()
            + self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outward notification that a plugin's momentum changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MomentumUpdate {
    pub plugin_id: String,
    pub momentum: f64,
    pub time: NaiveDateTime,
}

/// Member state broadcast by the backend when the user's focus changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    pub active_task_id: Option<String>,
    pub working_on: Option<String>,
    pub active_circuit: Option<String>,
}
