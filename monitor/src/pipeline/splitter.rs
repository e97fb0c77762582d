//! Splitting a staged log into bounded batch files.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rand::Rng;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

/// Maximum number of lines in one batch file.
pub const MAX_BATCH_LINES: usize = 500;

const BATCH_PREFIX: &str = "batch_";
const BATCH_EXTENSION: &str = ".flow";

/// True if `path` names a batch file produced by [`BatchNamer`].
#[must_use]
pub fn is_batch_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(BATCH_PREFIX) && n.ends_with(BATCH_EXTENSION))
}

/// Generates `batch_<timestamp>_<random>_<n>.flow` names for one split run.
///
/// The timestamp and random suffix are fixed per run; `n` is zero-padded so
/// names of one run sort in split order.
#[derive(Debug, Clone)]
pub struct BatchNamer {
    stamp: String,
    suffix: String,
    next: usize,
}

impl BatchNamer {
    #[must_use]
    pub fn new(now: NaiveDateTime) -> Self {
        let suffix = format!("{:08x}", rand::rng().random::<u32>());
        Self {
            stamp: now.format("%Y%m%d%H%M%S%3f").to_string(),
            suffix,
            next: 0,
        }
    }

    pub fn next_name(&mut self) -> String {
        let name = format!(
            "{BATCH_PREFIX}{}_{}_{:04}{BATCH_EXTENSION}",
            self.stamp, self.suffix, self.next
        );
        self.next += 1;
        name
    }
}

/// Copies the lines of `source` verbatim into batch files of at most
/// `max_lines` lines each, written into `out_dir`.
///
/// Returns the batch files in the order they were written. An empty source
/// produces no batch files.
pub async fn split_file(
    source: &Path,
    out_dir: &Path,
    max_lines: usize,
    namer: &mut BatchNamer,
) -> std::io::Result<Vec<PathBuf>> {
    let max_lines = max_lines.max(1);
    let mut lines = BufReader::new(File::open(source).await?).lines();

    let mut written = Vec::new();
    let mut current: Option<BufWriter<File>> = None;
    let mut in_current = 0;

    while let Some(line) = lines.next_line().await? {
        if current.is_none() || in_current == max_lines {
            if let Some(mut full) = current.take() {
                full.flush().await?;
            }
            let path = out_dir.join(namer.next_name());
            current = Some(BufWriter::new(File::create(&path).await?));
            written.push(path);
            in_current = 0;
        }

        if let Some(writer) = current.as_mut() {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            in_current += 1;
        }
    }

    if let Some(mut last) = current.take() {
        last.flush().await?;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn count_lines(path: &Path) -> std::io::Result<usize> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(contents.lines().count())
    }

    fn now() -> NaiveDateTime {
        "2023-04-17T08:55:00".parse().unwrap()
    }

    async fn split_lines(count: usize, max: usize) -> (tempfile::TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("active.flow");
        let body: String = (0..count).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&source, body).unwrap();

        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let mut namer = BatchNamer::new(now());
        let files = split_file(&source, &out, max, &mut namer).await.unwrap();
        (dir, files)
    }

    #[test]
    fn names_are_unique_and_ordered() {
        let mut namer = BatchNamer::new(now());
        let first = namer.next_name();
        let second = namer.next_name();

        assert!(first.starts_with("batch_20230417085500000_"));
        assert!(first.ends_with("_0000.flow"));
        assert!(first < second);
        assert!(is_batch_file(Path::new(&first)));
    }

    #[test]
    fn staged_log_is_not_a_batch_file() {
        assert!(!is_batch_file(Path::new("/x/preprocess/active.flow")));
        assert!(!is_batch_file(Path::new("/x/batch_1.tmp")));
    }

    #[tokio::test]
    async fn batch_count_is_ceiling_of_lines() {
        let (_dir, files) = split_lines(1201, MAX_BATCH_LINES).await;
        assert_eq!(files.len(), 3);

        let mut sizes = Vec::new();
        for file in &files {
            sizes.push(count_lines(file).await.unwrap());
        }
        assert_eq!(sizes, vec![500, 500, 201]);
    }

    #[tokio::test]
    async fn exact_multiple_does_not_leave_empty_batch() {
        let (_dir, files) = split_lines(10, 5).await;
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn empty_source_produces_no_batches() {
        let (_dir, files) = split_lines(0, 5).await;
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn lines_are_copied_verbatim_in_order() {
        let (_dir, files) = split_lines(7, 3).await;
        let mut joined = String::new();
        for file in &files {
            joined.push_str(&std::fs::read_to_string(file).unwrap());
        }
        let expected: String = (0..7).map(|i| format!("line {i}\n")).collect();
        assert_eq!(joined, expected);
    }
}
