//! Crash-safe batch pipeline for one plugin.
//!
//! The pipeline turns the append-only live log into bounded batch files and
//! publishes them. Every stage is a rename or a whole-file write inside the
//! plugin directory, so a crash at any point leaves files in a folder that
//! says how far they got:
//!
//! ```text
//! active.flow ──commit──▶ preprocess/active.flow
//!                              │ split (≤ 500 lines per file)
//!                              ▼
//!                         preprocess/batch_*.flow
//!                              │ promote (staged log deleted)
//!                              ▼
//!                         publish_queue/batch_*.flow
//!                              │ publish
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//!          archive/      publish_error/    (stays queued)
//!         acknowledged    unparseable      network failure
//! ```
//!
//! [`PluginPipeline::recover`] inspects `preprocess/` and finishes whatever a
//! previous run left behind. Delivery is at least once: a batch may be
//! published again after a crash between the acknowledgement and the move to
//! `archive/`, and keeps the same batch id when it is.

mod folders;
mod splitter;

pub use folders::{
    list_files, move_into, PipelineFolders, ARCHIVE_DIR, PREPROCESS_DIR, PUBLISH_ERROR_DIR,
    PUBLISH_QUEUE_DIR,
};
pub use splitter::{is_batch_file, split_file, BatchNamer, MAX_BATCH_LINES};

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::parser::{read_flow_batch, ReadError};
use crate::sender::FlowService;

/// Age after which archived batches are deleted (two months).
pub const ARCHIVE_RETENTION: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Errors that stop a pipeline stage.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{action} failed for {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError {
    let path = path.to_path_buf();
    move |source| PipelineError::Io {
        action,
        path,
        source,
    }
}

/// What [`PluginPipeline::recover`] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RecoveryAction {
    /// `preprocess/` was empty.
    Nothing,
    /// Only batch files were left; they were promoted.
    Promoted { batches: usize },
    /// A staged log was left; partial batches were discarded and it was
    /// split again.
    Resplit { discarded: usize, batches: usize },
}

/// Outcome of one publish pass over `publish_queue/`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub archived: usize,
    pub quarantined: usize,
    pub deferred: usize,
}

/// Outcome of a full pipeline cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub recovery: RecoveryAction,
    /// True if this cycle moved the live log away.
    pub committed: bool,
    /// Batches produced from the live log by this cycle's commit.
    pub committed_batches: usize,
    pub publish: PublishReport,
}

/// Batch pipeline bound to one plugin directory.
#[derive(Debug, Clone)]
pub struct PluginPipeline {
    plugin_id: String,
    folders: PipelineFolders,
    max_batch_lines: usize,
}

impl PluginPipeline {
    #[must_use]
    pub fn new(plugin_id: impl Into<String>, plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            folders: PipelineFolders::new(plugin_dir),
            max_batch_lines: MAX_BATCH_LINES,
        }
    }

    #[must_use]
    pub fn with_max_batch_lines(mut self, max: usize) -> Self {
        self.max_batch_lines = max.max(1);
        self
    }

    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    #[must_use]
    pub fn folders(&self) -> &PipelineFolders {
        &self.folders
    }

    async fn ensure_folders(&self) -> Result<()> {
        self.folders
            .ensure()
            .await
            .map_err(io_err("create folders", self.folders.root()))
    }

    async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        list_files(dir).await.map_err(io_err("list", dir))
    }

    /// Moves the live log into `preprocess/`.
    ///
    /// Returns the staged path, or `None` if there was no live log.
    pub async fn commit(&self) -> Result<Option<PathBuf>> {
        self.ensure_folders().await?;

        let live = self.folders.live();
        if fs::metadata(live).await.is_err() {
            debug!(plugin_id = %self.plugin_id, "No live log to commit");
            return Ok(None);
        }

        let staged = move_into(live, self.folders.preprocess())
            .await
            .map_err(io_err("commit", live))?;
        debug!(plugin_id = %self.plugin_id, path = %staged.display(), "Committed live log");
        Ok(Some(staged))
    }

    /// Splits a staged log into batch files beside it in `preprocess/`.
    pub async fn split(&self, staged: &Path) -> Result<Vec<PathBuf>> {
        let mut namer = BatchNamer::new(Local::now().naive_local());
        let batches = split_file(
            staged,
            self.folders.preprocess(),
            self.max_batch_lines,
            &mut namer,
        )
        .await
        .map_err(io_err("split", staged))?;

        debug!(
            plugin_id = %self.plugin_id,
            path = %staged.display(),
            batches = batches.len(),
            "Split staged log"
        );
        Ok(batches)
    }

    /// Deletes the staged logs and moves every batch file in `preprocess/`
    /// into `publish_queue/`. Returns the number of batches promoted.
    ///
    /// Staged logs are removed before any batch moves, so a batch in
    /// `publish_queue/` never coexists with the log it was split from.
    pub async fn promote(&self) -> Result<usize> {
        let (batches, staged): (Vec<PathBuf>, Vec<PathBuf>) = self
            .list(self.folders.preprocess())
            .await?
            .into_iter()
            .partition(|p| is_batch_file(p));

        for path in &staged {
            fs::remove_file(path)
                .await
                .map_err(io_err("remove staged log", path))?;
        }
        for path in &batches {
            move_into(path, self.folders.publish_queue())
                .await
                .map_err(io_err("promote", path))?;
        }
        Ok(batches.len())
    }

    /// Publishes every queued batch file in listing order.
    ///
    /// Acknowledged batches go to `archive/` and unparseable ones to
    /// `publish_error/`. The first network or server failure stops the pass;
    /// that file and the rest stay queued for the next cycle.
    pub async fn publish<S: FlowService>(&self, service: &S) -> Result<PublishReport> {
        self.ensure_folders().await?;
        let queued = self.list(self.folders.publish_queue()).await?;
        let mut report = PublishReport::default();

        for (index, path) in queued.iter().enumerate() {
            let file = file_name(path);

            let mut batch = match read_flow_batch(path, &self.plugin_id).await {
                Ok(batch) => batch,
                Err(e @ ReadError::Unparseable { .. }) => {
                    warn!(
                        plugin_id = %self.plugin_id,
                        file = %file,
                        error = %e,
                        "Quarantining unparseable batch"
                    );
                    move_into(path, self.folders.publish_error())
                        .await
                        .map_err(io_err("quarantine", path))?;
                    report.quarantined += 1;
                    continue;
                }
                Err(e @ ReadError::Io { .. }) => {
                    warn!(
                        plugin_id = %self.plugin_id,
                        file = %file,
                        error = %e,
                        "Batch unreadable, deferring"
                    );
                    report.deferred += 1;
                    continue;
                }
            };

            batch.time_sent = Some(Local::now().naive_local());
            if let Err(e) = service.publish_batch(&batch).await {
                warn!(
                    plugin_id = %self.plugin_id,
                    file = %file,
                    error = %e,
                    "Publish failed, batch stays queued"
                );
                report.deferred += queued.len() - index;
                break;
            }

            move_into(path, self.folders.archive())
                .await
                .map_err(io_err("archive", path))?;
            debug!(
                plugin_id = %self.plugin_id,
                file = %file,
                records = batch.len(),
                "Batch archived"
            );
            report.archived += 1;
        }

        if report != PublishReport::default() {
            info!(
                plugin_id = %self.plugin_id,
                archived = report.archived,
                quarantined = report.quarantined,
                deferred = report.deferred,
                "Publish pass complete"
            );
        }
        Ok(report)
    }

    /// True if `preprocess/` holds anything.
    pub async fn needs_recovery(&self) -> Result<bool> {
        Ok(!self.list(self.folders.preprocess()).await?.is_empty())
    }

    /// Finishes work an interrupted cycle left in `preprocess/`.
    pub async fn recover(&self) -> Result<RecoveryAction> {
        self.ensure_folders().await?;
        let leftovers = self.list(self.folders.preprocess()).await?;
        if leftovers.is_empty() {
            return Ok(RecoveryAction::Nothing);
        }

        let (batches, staged): (Vec<PathBuf>, Vec<PathBuf>) =
            leftovers.into_iter().partition(|p| is_batch_file(p));

        if staged.is_empty() {
            let promoted = self.promote().await?;
            info!(plugin_id = %self.plugin_id, batches = promoted, "Recovered split batches");
            return Ok(RecoveryAction::Promoted { batches: promoted });
        }

        for partial in &batches {
            fs::remove_file(partial)
                .await
                .map_err(io_err("discard partial batch", partial))?;
        }
        for log in &staged {
            self.split(log).await?;
        }
        let promoted = self.promote().await?;

        info!(
            plugin_id = %self.plugin_id,
            discarded = batches.len(),
            batches = promoted,
            "Recovered staged log"
        );
        Ok(RecoveryAction::Resplit {
            discarded: batches.len(),
            batches: promoted,
        })
    }

    /// Recover if needed, then commit, split, promote, and publish.
    pub async fn run_cycle<S: FlowService>(&self, service: &S) -> Result<CycleReport> {
        let recovery = if self.needs_recovery().await? {
            self.recover().await?
        } else {
            RecoveryAction::Nothing
        };

        let staged = self.commit().await?;
        let committed = staged.is_some();
        let committed_batches = match staged {
            Some(staged) => {
                self.split(&staged).await?;
                self.promote().await?
            }
            None => 0,
        };

        let publish = self.publish(service).await?;

        Ok(CycleReport {
            recovery,
            committed,
            committed_batches,
            publish,
        })
    }

    /// Deletes archived batches older than `max_age`.
    pub async fn sweep_archive(&self, max_age: Duration) -> Result<usize> {
        self.sweep_archive_at(SystemTime::now(), max_age).await
    }

    /// Same as [`sweep_archive`](Self::sweep_archive) with an explicit clock.
    ///
    /// Age is measured from the creation time, or the modification time
    /// where the platform does not record creation.
    pub async fn sweep_archive_at(&self, now: SystemTime, max_age: Duration) -> Result<usize> {
        let mut deleted = 0;
        for path in self.list(self.folders.archive()).await? {
            let metadata = fs::metadata(&path)
                .await
                .map_err(io_err("stat archived batch", &path))?;
            let Ok(born) = metadata.created().or_else(|_| metadata.modified()) else {
                continue;
            };

            let expired = now.duration_since(born).is_ok_and(|age| age > max_age);
            if expired {
                fs::remove_file(&path)
                    .await
                    .map_err(io_err("delete archived batch", &path))?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(plugin_id = %self.plugin_id, deleted, "Swept archived batches");
        }
        Ok(deleted)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
