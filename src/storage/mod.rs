//! Persistent state
//!
//! The agent persists almost nothing across restarts by design: only the
//! singleton lock file (here), the encrypted config cache, and the optional
//! rotating batch logs (both under `config`/`batch`).

mod lockfile;

pub use lockfile::{ScannerLock, LOCK_FILE_NAME};
