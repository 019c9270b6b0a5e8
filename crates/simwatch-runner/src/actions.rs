//! Side effects on attempts: launching, restarting, stopping and killing
//! their processes, and the marker files that go with them.

use crate::attempt::{
    AttemptId, AttemptRecord, CONFIG_FILE, CONFIG_SECTION, ERROR_MARKER, RESTART_DIR_PREFIX,
    STOP_MARKER,
};
use crate::checkpoint::CheckpointManager;
use crate::conf::ConfDocument;
use crate::probe::tail_lines;
use crate::process::{is_alive, kill, spawn_detached, spawn_fire_and_forget};
use crate::tree::AttemptTree;
use crate::{atomic_write_bytes, ensure_dir, now_epoch_seconds};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

fn launch_command(node: &AttemptRecord) -> Result<String> {
    let config = node
        .config
        .as_ref()
        .ok_or_else(|| anyhow!("{} is not an attempt", node.path.display()))?;
    let command = if node.level > 1 {
        config
            .restart_command
            .as_ref()
            .or(config.start_command.as_ref())
    } else {
        config.start_command.as_ref()
    };
    command
        .cloned()
        .ok_or_else(|| anyhow!("no launch command configured in {}", node.config_path().display()))
}

fn launch(dir: &Path, command: &str) -> Result<i32> {
    let pid = spawn_detached(command, dir)?;
    let conf_path = dir.join(CONFIG_FILE);
    let mut doc = ConfDocument::load(&conf_path)?;
    let now = format!("{:.6}", now_epoch_seconds());
    doc.set(CONFIG_SECTION, "PID", pid);
    doc.set(CONFIG_SECTION, "Timestamp_started", &now);
    doc.set(CONFIG_SECTION, "Timestamp_last_updated", &now);
    doc.save(&conf_path)
        .with_context(|| format!("failed to record pid {} in {}", pid, conf_path.display()))?;
    Ok(pid)
}

pub fn start_attempt(node: &AttemptRecord) -> Result<i32> {
    if let Some(pid) = node.pid.filter(|pid| is_alive(*pid)) {
        return Err(anyhow!(
            "attempt {} is already running as pid {}",
            node.path.display(),
            pid
        ));
    }
    if node.has_started() {
        return Err(anyhow!(
            "attempt {} was already started; restart it instead",
            node.path.display()
        ));
    }
    let command = launch_command(node)?;
    let pid = launch(&node.path, &command)?;
    tracing::info!(attempt_id = node.id, path = %node.path.display(), pid, "started attempt");
    Ok(pid)
}

fn next_restart_dir(dir: &Path) -> Result<PathBuf> {
    let mut highest = 0u32;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(n) = name
            .strip_prefix(RESTART_DIR_PREFIX)
            .and_then(|suffix| suffix.parse::<u32>().ok())
        {
            highest = highest.max(n);
        }
    }
    Ok(dir.join(format!("{}{}", RESTART_DIR_PREFIX, highest + 1)))
}

/// Continues `candidate_id` in a new nested attempt directory and returns it.
///
/// The child config is a copy of the candidate's with the process fields
/// cleared and `T_start` moved to the candidate's model time. Its restart
/// file is seeded from [`CheckpointManager::restart_source`].
pub fn restart_attempt(
    tree: &AttemptTree,
    candidate_id: AttemptId,
    checkpoints: &CheckpointManager,
) -> Result<PathBuf> {
    let candidate = tree
        .get(candidate_id)
        .filter(|n| !n.is_root())
        .ok_or_else(|| anyhow!("no attempt with id {}", candidate_id))?;
    let config = candidate
        .config
        .as_ref()
        .ok_or_else(|| anyhow!("{} is not an attempt", candidate.path.display()))?;
    let command = config
        .restart_command
        .as_ref()
        .or(config.start_command.as_ref())
        .cloned()
        .ok_or_else(|| {
            anyhow!(
                "no restart command configured in {}",
                candidate.config_path().display()
            )
        })?;

    let restarts_done = tree.children(candidate_id).count();
    let source = checkpoints.restart_source(candidate, restarts_done)?;

    let dir = next_restart_dir(&candidate.path)?;
    ensure_dir(&dir)?;
    let mut doc = ConfDocument::load(&candidate.config_path())?;
    doc.set(CONFIG_SECTION, "PID", 0);
    doc.set(CONFIG_SECTION, "Timestamp_started", 0);
    doc.set(CONFIG_SECTION, "Timestamp_last_updated", 0);
    doc.set(CONFIG_SECTION, "T_start", candidate.t);
    doc.save(&dir.join(CONFIG_FILE))?;

    if let (Some(src), Some(name)) = (source, config.restart_file.as_deref()) {
        let dest = dir.join(name);
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(&src, &dest).with_context(|| {
            format!("failed to seed {} from {}", dest.display(), src.display())
        })?;
        tracing::debug!(attempt_id = candidate_id, from = %src.display(), "seeded restart file");
    }

    let pid = launch(&dir, &command)?;
    tracing::info!(
        attempt_id = candidate_id,
        path = %dir.display(),
        pid,
        t = candidate.t,
        "restarted attempt"
    );
    Ok(dir)
}

/// Asks the simulation to stop on its own: writes the `STOP` marker and
/// fires `Stop_command` when one is configured. Nothing waits for the stop.
pub fn request_stop(node: &AttemptRecord) -> Result<()> {
    let marker = node.file(STOP_MARKER);
    atomic_write_bytes(&marker, format!("{}\n", Utc::now().to_rfc3339()).as_bytes())?;
    if let Some(command) = node.config.as_ref().and_then(|c| c.stop_command.as_deref()) {
        spawn_fire_and_forget(command, &node.path)?;
    }
    tracing::info!(attempt_id = node.id, path = %node.path.display(), "requested stop");
    Ok(())
}

pub fn kill_attempt(node: &AttemptRecord) -> Result<bool> {
    let Some(pid) = node.pid.filter(|pid| is_alive(*pid)) else {
        tracing::debug!(attempt_id = node.id, "no live process to kill");
        return Ok(false);
    };
    kill(pid)?;
    tracing::info!(attempt_id = node.id, path = %node.path.display(), pid, "killed attempt");
    Ok(true)
}

/// Writes the permanent-failure marker; the lineage is never restarted again.
pub fn mark_error(node: &AttemptRecord, reason: &str) -> Result<()> {
    let body = format!("{}\n{}\n", Utc::now().to_rfc3339(), reason);
    atomic_write_bytes(&node.file(ERROR_MARKER), body.as_bytes())?;
    tracing::warn!(
        attempt_id = node.id,
        path = %node.path.display(),
        reason,
        "marked attempt as failed"
    );
    Ok(())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OutputTail {
    pub attempt_id: AttemptId,
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Last `lines` lines of the output file of every attempt in the lineage of
/// `id`, in discovery order.
pub fn recent_output(tree: &AttemptTree, id: AttemptId, lines: usize) -> Result<Vec<OutputTail>> {
    let head = tree
        .lineage_head(id)
        .ok_or_else(|| anyhow!("no attempt with id {}", id))?;
    let mut lineage = vec![head.id];
    let mut cursor = 0;
    while cursor < lineage.len() {
        let next: Vec<AttemptId> = tree.children(lineage[cursor]).map(|c| c.id).collect();
        lineage.extend(next);
        cursor += 1;
    }
    lineage.sort_unstable();

    let mut tails = Vec::new();
    for attempt_id in lineage {
        let Some(node) = tree.get(attempt_id) else {
            continue;
        };
        let Some(output) = node.output_path().filter(|p| p.is_file()) else {
            continue;
        };
        let lines = tail_lines(&output, lines)?;
        tails.push(OutputTail {
            attempt_id,
            path: output,
            lines,
        });
    }
    Ok(tails)
}
