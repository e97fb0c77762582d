//! Integration tests for the flow state engine.
//!
//! Records are read from real log files the way the agent reads them, passed
//! through the de-duplicator, and fed to the engine.

use std::io::Write;
use std::path::Path;

use chrono::NaiveDateTime;
use flowpulse_monitor::flow::{ActivityState, FlowStateEngine, RecordDeduplicator, Snapshot};
use flowpulse_monitor::sender::FlowStateTable;
use flowpulse_monitor::types::{ActivityRecord, MemberState};
use flowpulse_monitor::read_log;
use serde_json::json;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

fn t(s: &str) -> NaiveDateTime {
    s.parse().unwrap()
}

fn modification(end: &str, count: u32) -> String {
    format!(
        r#"ModificationActivity={{"durationInSeconds":30,"endTime":"{end}","modificationCount":{count}}}"#
    )
}

fn editor(end: &str, file: &str, seconds: u64) -> String {
    format!(
        r#"EditorActivity={{"durationInSeconds":{seconds},"endTime":"{end}","module":"core","filePath":"{file}","isModified":true}}"#
    )
}

fn append(path: &Path, lines: &[String]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

/// Reads the whole log and returns the records the de-duplicator admits.
async fn reread(path: &Path, dedup: &mut RecordDeduplicator) -> Vec<ActivityRecord> {
    let mut records = Vec::new();
    let outcome = read_log(path, &mut records, |acc, _kind, record| acc.push(record)).await;
    assert!(outcome.is_successful());
    dedup.admit(records)
}

fn member(task: &str, working_on: &str) -> MemberState {
    MemberState {
        active_task_id: Some(task.to_string()),
        working_on: Some(working_on.to_string()),
        active_circuit: None,
    }
}

// =============================================================================
// Log Re-reads
// =============================================================================

#[tokio::test]
async fn test_rereading_log_counts_each_record_once() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("active.flow");
    let mut dedup = RecordDeduplicator::new();
    let mut engine = FlowStateEngine::new("intellij", false);
    let now = t("2023-04-17T08:57:40");

    append(
        &log,
        &[
            modification("2023-04-17T08:51:00", 100),
            modification("2023-04-17T08:56:00", 100),
        ],
    );
    let update = engine.ingest(reread(&log, &mut dedup).await, now);
    // 08:50 totals 100 and decays from zero; 08:55 totals 200 and gains.
    assert_eq!(update.unwrap().momentum, 5.0);

    append(&log, &[modification("2023-04-17T08:57:30", 10)]);
    let admitted = reread(&log, &mut dedup).await;
    assert_eq!(admitted.len(), 1);

    assert!(engine.ingest(admitted, now).is_none());
    assert_eq!(engine.bucket(t("2023-04-17T08:55:00")).unwrap().count, 110);
    assert_eq!(engine.bucket(t("2023-04-17T08:50:00")).unwrap().count, 100);
}

#[tokio::test]
async fn test_editor_log_builds_file_report() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("active.flow");
    let mut dedup = RecordDeduplicator::new();
    let mut engine = FlowStateEngine::new("intellij", false);

    append(
        &log,
        &[
            editor("2023-04-17T09:01:00", "src/main.rs", 40),
            editor("2023-04-17T09:02:00", "src/lib.rs", 15),
            editor("2023-04-17T09:03:00", "src/main.rs", 40),
        ],
    );
    engine.ingest(reread(&log, &mut dedup).await, t("2023-04-17T09:04:00"));

    let report = engine.file_activity_report();
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].file_path, "src/main.rs");
    assert_eq!(report[0].duration_seconds, 80);
    assert_eq!(engine.activity_state(), ActivityState::Flow);
}

// =============================================================================
// Snapshots
// =============================================================================

#[test]
fn test_wide_table_snapshot_seeds_engine() {
    let table = FlowStateTable {
        columns: vec![
            "time".to_string(),
            "momentum".to_string(),
            "rolloverBucketHistory".to_string(),
        ],
        rows: vec![vec![
            json!("2023-04-17T08:30:00"),
            json!(100),
            json!("200 [0, 200, 0, 0, 0]"),
        ]],
    };
    let snapshot = Snapshot::from_map(&table.to_key_value_map()).unwrap();

    let mut engine = FlowStateEngine::new("intellij", false);
    let update = engine.apply_snapshot(snapshot, t("2023-04-17T08:36:00"));

    assert_eq!(update.unwrap().momentum, 110.0);
    assert_eq!(
        engine.status().snapshot_time,
        Some(t("2023-04-17T08:30:00"))
    );
}

#[test]
fn test_pair_table_with_missing_history_is_rejected() {
    let table = FlowStateTable {
        columns: vec!["key".to_string(), "value".to_string()],
        rows: vec![
            vec![json!("time"), json!("2023-04-17T08:30:00")],
            vec![json!("momentum"), json!("12.5")],
        ],
    };
    assert!(Snapshot::from_map(&table.to_key_value_map()).is_err());
}

#[test]
fn test_non_finite_table_values_leave_momentum_bounded() {
    let table = FlowStateTable {
        columns: vec!["key".to_string(), "value".to_string()],
        rows: vec![
            vec![json!("time"), json!("2023-04-17T08:30:00")],
            vec![json!("momentum"), json!("NaN")],
            vec![json!("rolloverBucketHistory"), json!("0 [0, 0, 0, 0]")],
        ],
    };
    assert!(Snapshot::from_map(&table.to_key_value_map()).is_err());

    // The caller keeps its previous state and recomputes locally.
    let mut engine = FlowStateEngine::new("intellij", false);
    let now = t("2023-04-17T08:36:00");
    let first = engine.refresh(now).unwrap().momentum;
    assert!((0.0..=200.0).contains(&first));
    assert!(engine.refresh(now).is_none());
}

// =============================================================================
// Collaborator Signals
// =============================================================================

#[test]
fn test_task_switch_after_active_stretch() {
    let mut engine = FlowStateEngine::new("intellij", true);
    let now = t("2023-04-17T10:00:00");

    engine.update_member_state(member("task-1", "parser"), now);
    let credited = engine.update_member_state(member("task-1", "lexer"), now);
    assert_eq!(credited.unwrap().momentum, 5.0);

    let reset = engine.update_member_state(member("task-2", "lexer"), now);
    assert_eq!(reset.unwrap().momentum, 0.0);

    let status = engine.status();
    assert_eq!(status.plugin_id, "intellij");
    assert_eq!(status.streak_start, None);
}

#[test]
fn test_status_serializes_camel_case() {
    let engine = FlowStateEngine::new("vscode", false);
    let value = serde_json::to_value(engine.status()).unwrap();

    assert_eq!(value["pluginId"], "vscode");
    assert_eq!(value["activityState"], "IDLE");
    assert_eq!(value["consecutiveIdleBuckets"], 0);
}
