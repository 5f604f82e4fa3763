//! Singleton scanner lock
//!
//! Two agents on one workstation would double-report every detection, so
//! startup claims `scanner.lock` before anything else runs. The lock records
//! the owning PID and its executable stem; whether a previous owner is still
//! alive is decided against the host's process table, and a PID that was
//! recycled by an unrelated program does not count as a live owner.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::host::HostOs;

/// Lock file name.
pub const LOCK_FILE_NAME: &str = "scanner.lock";

/// What a lock file claims about its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockHolder {
    pid: u32,
    exe_stem: String,
}

impl LockHolder {
    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let exe_stem = lines.next()?.trim().to_lowercase();
        if exe_stem.is_empty() {
            return None;
        }
        Some(Self { pid, exe_stem })
    }

    fn for_current_process() -> Self {
        let exe_stem = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self {
            pid: std::process::id(),
            exe_stem,
        }
    }

    fn serialize(&self) -> String {
        format!("{}\n{}\n", self.pid, self.exe_stem)
    }

    /// Live means: the recorded PID exists right now AND still runs the
    /// recorded executable. A recycled PID running something else is stale.
    fn is_live(&self, host: &dyn HostOs) -> bool {
        host.processes().iter().any(|p| {
            p.pid == self.pid
                && Path::new(&p.name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_lowercase() == self.exe_stem)
                    .unwrap_or(false)
        })
    }
}

/// Held for the whole process lifetime; removed again on drop.
#[derive(Debug)]
pub struct ScannerLock {
    path: PathBuf,
    released: bool,
}

impl ScannerLock {
    /// Claim the lock in `dir`, reclaiming stale locks from dead or
    /// unrelated processes. A live owner aborts startup.
    pub fn acquire(dir: impl AsRef<Path>, host: &dyn HostOs) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory {dir:?}"))?;
        let path = dir.join(LOCK_FILE_NAME);

        if let Ok(contents) = fs::read_to_string(&path) {
            match LockHolder::parse(&contents) {
                Some(holder) if holder.is_live(host) => {
                    bail!(
                        "Another scanner instance is already running (PID {}, {}). \
                         Stop it first, or remove {:?} if that PID is not a scanner.",
                        holder.pid,
                        holder.exe_stem,
                        path
                    );
                }
                Some(holder) => {
                    tracing::info!(
                        pid = holder.pid,
                        exe = %holder.exe_stem,
                        "Reclaiming lock from dead or unrelated process"
                    );
                }
                None => {
                    tracing::warn!(path = %path.display(), "Lock file unreadable - reclaiming");
                }
            }
        }

        let me = LockHolder::for_current_process();
        fs::write(&path, me.serialize())
            .with_context(|| format!("Failed to write lock file {path:?}"))?;
        tracing::debug!(pid = me.pid, path = %path.display(), "Scanner lock acquired");

        Ok(Self {
            path,
            released: false,
        })
    }

    /// Remove the lock file. Runs automatically on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Scanner lock released"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Lock removal failed"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScannerLock {
    fn drop(&mut self) {
        self.release();
    }
}
