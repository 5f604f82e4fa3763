//! Rotating on-disk batch log
//!
//! When `NEW_BATCHES_LOG` is enabled every emitted batch report is also
//! written as pretty JSON under the batch log directory, keeping only the
//! most recent files. Purely diagnostic - failures are logged and ignored.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::warn;

use crate::types::UnifiedBatchReport;

/// Log files retained per directory.
const MAX_LOG_FILES: usize = 20;

#[derive(Debug, Clone)]
pub struct BatchLog {
    dir: PathBuf,
}

impl BatchLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Write one report and prune old files.
    pub fn write(&self, report: &UnifiedBatchReport) {
        if let Err(e) = self.try_write(report) {
            warn!(dir = %self.dir.display(), error = %e, "Batch log write failed");
        }
    }

    fn try_write(&self, report: &UnifiedBatchReport) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .dir
            .join(format!("batch_{stamp}_{}.json", report.batch_number));
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)?;
        self.prune();
        Ok(())
    }

    fn prune(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("batch_")
                    .map_or(false, |rest| rest.ends_with(".json"))
            })
            .filter_map(|e| {
                let mtime = e.metadata().ok()?.modified().ok()?;
                Some((mtime, e.path()))
            })
            .collect();

        if files.len() <= MAX_LOG_FILES {
            return;
        }
        files.sort_by_key(|(mtime, _)| *mtime);
        for (_, path) in files.iter().take(files.len() - MAX_LOG_FILES) {
            let _ = std::fs::remove_file(path);
        }
    }
}
