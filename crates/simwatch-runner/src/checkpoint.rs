//! Rolling backups of an attempt's restart snapshot.
//!
//! Backups live next to the restart file as `<Restart_file>.bak.<t>`, with
//! the model time formatted to six decimals. Ordering is by the numeric
//! value of the tag, never by name.

use crate::attempt::AttemptRecord;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const BACKUP_INFIX: &str = ".bak.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackupOutcome {
    /// The attempt names no `Restart_file`.
    NotConfigured,
    /// `Restart_file` is configured but not written yet.
    SnapshotMissing,
    UpToDate { backup: PathBuf },
    Created { backup: PathBuf, pruned: Vec<PathBuf> },
}

#[derive(Debug, Clone, Copy)]
pub struct CheckpointManager {
    default_retention: u32,
}

impl CheckpointManager {
    /// `default_retention` of 0 keeps every backup.
    pub fn new(default_retention: u32) -> Self {
        Self { default_retention }
    }

    pub fn retention_for(&self, node: &AttemptRecord) -> u32 {
        node.config
            .as_ref()
            .and_then(|c| c.max_checkpoints)
            .unwrap_or(self.default_retention)
    }

    pub fn backup(&self, node: &AttemptRecord) -> Result<BackupOutcome> {
        let Some(snapshot) = node.restart_file_path() else {
            tracing::debug!(attempt_id = node.id, "no restart file configured, skipping backup");
            return Ok(BackupOutcome::NotConfigured);
        };
        if !snapshot.is_file() {
            return Ok(BackupOutcome::SnapshotMissing);
        }
        let backup = backup_path(&snapshot, node.t);
        if backup.exists() {
            return Ok(BackupOutcome::UpToDate { backup });
        }

        let tmp = backup.with_file_name(format!(
            ".{}.tmp.{}",
            file_name(&backup),
            Utc::now().timestamp_micros()
        ));
        fs::copy(&snapshot, &tmp).with_context(|| {
            format!(
                "failed to copy {} to {}",
                snapshot.display(),
                tmp.display()
            )
        })?;
        fs::rename(&tmp, &backup)
            .with_context(|| format!("failed to move backup into {}", backup.display()))?;
        tracing::info!(
            attempt_id = node.id,
            path = %backup.display(),
            t = node.t,
            "created checkpoint backup"
        );

        let pruned = self.prune(node)?;
        Ok(BackupOutcome::Created { backup, pruned })
    }

    pub fn list_backups(&self, node: &AttemptRecord) -> Result<Vec<PathBuf>> {
        let Some(snapshot) = node.restart_file_path() else {
            return Ok(Vec::new());
        };
        list_tagged(&snapshot)
    }

    pub fn prune(&self, node: &AttemptRecord) -> Result<Vec<PathBuf>> {
        let cap = self.retention_for(node) as usize;
        if cap == 0 {
            return Ok(Vec::new());
        }
        let backups = self.list_backups(node)?;
        if backups.len() <= cap {
            return Ok(Vec::new());
        }
        let excess = backups.len() - cap;
        let mut pruned = Vec::with_capacity(excess);
        for old in backups.into_iter().take(excess) {
            fs::remove_file(&old)
                .with_context(|| format!("failed to remove old backup {}", old.display()))?;
            tracing::debug!(attempt_id = node.id, path = %old.display(), "pruned checkpoint backup");
            pruned.push(old);
        }
        Ok(pruned)
    }

    /// Snapshot used to seed the next restart of `node`.
    ///
    /// `restarts_done` is how many restarts of this candidate already exist:
    /// the first restart takes the newest backup, each later one steps back
    /// one backup, and the live restart file is used once backups run out.
    pub fn restart_source(
        &self,
        node: &AttemptRecord,
        restarts_done: usize,
    ) -> Result<Option<PathBuf>> {
        let Some(snapshot) = node.restart_file_path() else {
            return Ok(None);
        };
        let backups = list_tagged(&snapshot)?;
        if let Some(backup) = backups.iter().rev().nth(restarts_done) {
            return Ok(Some(backup.clone()));
        }
        Ok(snapshot.is_file().then_some(snapshot))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn backup_path(snapshot: &Path, t: f64) -> PathBuf {
    snapshot.with_file_name(format!("{}{}{:.6}", file_name(snapshot), BACKUP_INFIX, t))
}

fn list_tagged(snapshot: &Path) -> Result<Vec<PathBuf>> {
    let Some(dir) = snapshot.parent() else {
        return Ok(Vec::new());
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}{}", file_name(snapshot), BACKUP_INFIX);
    let mut tagged: Vec<(f64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(tag) = name.strip_prefix(&prefix) else {
            continue;
        };
        if let Ok(t) = tag.parse::<f64>() {
            tagged.push((t, entry.path()));
        }
    }
    tagged.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(tagged.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptConfig;
    use crate::test_support::temp_root;

    fn node(dir: &Path, t: f64, max_checkpoints: Option<u32>) -> AttemptRecord {
        let cfg = AttemptConfig {
            code_name: "DemoSimulation".to_string(),
            restart_file: Some("restart.txt".to_string()),
            max_checkpoints,
            ..AttemptConfig::default()
        };
        let mut rec = AttemptRecord::from_config(1, dir, 0, 1, cfg);
        rec.t = t;
        rec
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths.iter().map(|p| file_name(p)).collect()
    }

    #[test]
    fn backup_requires_configured_and_existing_snapshot() {
        let root = temp_root("ckpt_missing");
        let manager = CheckpointManager::new(20);
        let mut bare = node(&root, 1.0, None);
        bare.config = Some(AttemptConfig {
            code_name: "DemoSimulation".to_string(),
            ..AttemptConfig::default()
        });
        assert_eq!(manager.backup(&bare).expect("backup"), BackupOutcome::NotConfigured);
        assert_eq!(
            manager.backup(&node(&root, 1.0, None)).expect("backup"),
            BackupOutcome::SnapshotMissing
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn backup_is_tagged_by_model_time_and_not_repeated() {
        let root = temp_root("ckpt_tag");
        fs::write(root.join("restart.txt"), "state at 2.5").expect("snapshot");
        let manager = CheckpointManager::new(20);
        let rec = node(&root, 2.5, None);
        let created = manager.backup(&rec).expect("backup");
        let expected = root.join("restart.txt.bak.2.500000");
        assert_eq!(
            created,
            BackupOutcome::Created {
                backup: expected.clone(),
                pruned: Vec::new()
            }
        );
        assert_eq!(fs::read_to_string(&expected).expect("read"), "state at 2.5");
        assert_eq!(
            manager.backup(&rec).expect("again"),
            BackupOutcome::UpToDate { backup: expected }
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn retention_removes_lowest_tags_first() {
        let root = temp_root("ckpt_retention");
        fs::write(root.join("restart.txt"), "s").expect("snapshot");
        let manager = CheckpointManager::new(20);
        let mut last = None;
        for t in [2.0, 10.0, 3.0, 11.0] {
            last = Some(manager.backup(&node(&root, t, Some(3))).expect("backup"));
        }
        match last {
            Some(BackupOutcome::Created { pruned, .. }) => {
                assert_eq!(names(&pruned), ["restart.txt.bak.2.000000"]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let kept = manager.list_backups(&node(&root, 0.0, Some(3))).expect("list");
        assert_eq!(
            names(&kept),
            [
                "restart.txt.bak.3.000000",
                "restart.txt.bak.10.000000",
                "restart.txt.bak.11.000000"
            ]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let root = temp_root("ckpt_unlimited");
        fs::write(root.join("restart.txt"), "s").expect("snapshot");
        let manager = CheckpointManager::new(0);
        for t in 0..5 {
            manager.backup(&node(&root, t as f64, None)).expect("backup");
        }
        assert_eq!(manager.list_backups(&node(&root, 0.0, None)).expect("list").len(), 5);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn restart_source_steps_back_through_backups() {
        let root = temp_root("ckpt_source");
        let manager = CheckpointManager::new(20);
        let rec = node(&root, 0.0, None);
        assert_eq!(manager.restart_source(&rec, 0).expect("source"), None);

        fs::write(root.join("restart.txt"), "live").expect("snapshot");
        for t in [4.0, 8.0] {
            manager.backup(&node(&root, t, None)).expect("backup");
        }
        let pick = |n| {
            manager
                .restart_source(&rec, n)
                .expect("source")
                .map(|p| file_name(&p))
        };
        assert_eq!(pick(0).as_deref(), Some("restart.txt.bak.8.000000"));
        assert_eq!(pick(1).as_deref(), Some("restart.txt.bak.4.000000"));
        assert_eq!(pick(2).as_deref(), Some("restart.txt"));
        let _ = fs::remove_dir_all(root);
    }
}
