//! Supervision of long-running simulation attempts laid out on disk.
//!
//! Every scheduling pass rebuilds the attempt tree from the filesystem
//! ([`tree`]), reconciles lineage statuses ([`reconcile`]) and lets the
//! [`scheduler::Supervisor`] start, restart, kill or back up attempts under a
//! global concurrency budget.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod actions;
pub mod attempt;
pub mod checkpoint;
pub mod conf;
pub mod config;
pub mod logging;
pub mod probe;
pub mod process;
pub mod reconcile;
pub mod scheduler;
pub mod tree;

pub use attempt::{AttemptConfig, AttemptId, AttemptRecord, Status};
pub use checkpoint::{BackupOutcome, CheckpointManager};
pub use config::DaemonConfig;
pub use probe::{ProbeRegistry, StatusProbe};
pub use reconcile::reconcile;
pub use scheduler::{ActionKind, Supervisor, TickAction, TickReport};
pub use tree::{AttemptSnapshot, AttemptTree, TreeBuilder};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

/// Writes through a sibling temp file and renames it over `path`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Seconds since the Unix epoch, 0.0 for times before it.
pub fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn now_epoch_seconds() -> f64 {
    epoch_seconds(SystemTime::now())
}
