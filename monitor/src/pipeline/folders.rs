//! The per-plugin folder set that backs the batch pipeline.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::watcher::LIVE_LOG_NAME;

pub const PREPROCESS_DIR: &str = "preprocess";
pub const PUBLISH_QUEUE_DIR: &str = "publish_queue";
pub const ARCHIVE_DIR: &str = "archive";
pub const PUBLISH_ERROR_DIR: &str = "publish_error";

/// Paths of the live log and the four stage folders beside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFolders {
    root: PathBuf,
    live: PathBuf,
    preprocess: PathBuf,
    publish_queue: PathBuf,
    archive: PathBuf,
    publish_error: PathBuf,
}

impl PipelineFolders {
    #[must_use]
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        let root = plugin_dir.into();
        Self {
            live: root.join(LIVE_LOG_NAME),
            preprocess: root.join(PREPROCESS_DIR),
            publish_queue: root.join(PUBLISH_QUEUE_DIR),
            archive: root.join(ARCHIVE_DIR),
            publish_error: root.join(PUBLISH_ERROR_DIR),
            root,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn live(&self) -> &Path {
        &self.live
    }

    #[must_use]
    pub fn preprocess(&self) -> &Path {
        &self.preprocess
    }

    #[must_use]
    pub fn publish_queue(&self) -> &Path {
        &self.publish_queue
    }

    #[must_use]
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    #[must_use]
    pub fn publish_error(&self) -> &Path {
        &self.publish_error
    }

    /// Creates any missing stage folder.
    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            &self.preprocess,
            &self.publish_queue,
            &self.archive,
            &self.publish_error,
        ] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Regular files directly inside `dir`, sorted by name.
///
/// A missing directory lists as empty.
pub async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Renames `file` into `dir`, keeping its file name.
pub async fn move_into(file: &Path, dir: &Path) -> std::io::Result<PathBuf> {
    let name = file.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no file name", file.display()),
        )
    })?;
    let target = dir.join(name);
    fs::rename(file, &target).await?;
    Ok(target)
}
