//! The supervision pass.
//!
//! A pass rebuilds the tree, walks every unfinished attempt in niceness order
//! and applies at most one action to each: back up a running attempt, kill a
//! stalled one, restart or escalate a stopped lineage, or start a new one.
//! Starts and restarts are bounded by `max_concurrent_jobs`. All pass state
//! lives in [`Supervisor::schedule`]; nothing carries over between passes.

use crate::actions::{kill_attempt, mark_error, restart_attempt, start_attempt};
use crate::attempt::{AttemptId, AttemptRecord, Status};
use crate::checkpoint::{BackupOutcome, CheckpointManager};
use crate::config::DaemonConfig;
use crate::probe::ProbeRegistry;
use crate::reconcile::reconcile;
use crate::tree::{AttemptTree, TreeBuilder};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Backup,
    Kill,
    Restart,
    Start,
    Escalate,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickAction {
    pub kind: ActionKind,
    pub attempt_id: AttemptId,
    pub path: PathBuf,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TickAction {
    fn done(kind: ActionKind, node: &AttemptRecord, detail: Option<String>) -> Self {
        Self {
            kind,
            attempt_id: node.id,
            path: node.path.clone(),
            ok: true,
            detail,
            error: None,
        }
    }

    fn failed(kind: ActionKind, node: &AttemptRecord, err: &anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        tracing::error!(
            attempt_id = node.id,
            path = %node.path.display(),
            action = ?kind,
            error = %message,
            "action failed"
        );
        Self {
            kind,
            attempt_id: node.id,
            path: node.path.clone(),
            ok: false,
            detail: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub started_at: String,
    pub reconcile_passes: usize,
    pub actions: Vec<TickAction>,
    pub concurrent_jobs: usize,
    pub max_concurrent_jobs: usize,
    /// Status counts of the tree as it was before any action of the pass.
    pub status_counts: BTreeMap<Status, usize>,
}

impl TickReport {
    pub fn actions_of(&self, kind: ActionKind) -> impl Iterator<Item = &TickAction> + '_ {
        self.actions.iter().filter(move |a| a.kind == kind)
    }

    pub fn failures(&self) -> usize {
        self.actions.iter().filter(|a| !a.ok).count()
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    config: DaemonConfig,
    registry: ProbeRegistry,
    checkpoints: CheckpointManager,
}

impl Supervisor {
    pub fn new(config: DaemonConfig) -> Self {
        Self::with_registry(config, ProbeRegistry::with_builtins())
    }

    pub fn with_registry(config: DaemonConfig, registry: ProbeRegistry) -> Self {
        let checkpoints = CheckpointManager::new(config.max_checkpoints);
        Self {
            config,
            registry,
            checkpoints,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProbeRegistry {
        &self.registry
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Fresh, reconciled tree plus the number of reconcile passes it took.
    pub fn build_tree(&self) -> Result<(AttemptTree, usize)> {
        let mut tree = TreeBuilder::new(&self.registry, self.config.stall_time)
            .build(&self.config.root_dir)?;
        let passes = reconcile(&mut tree);
        Ok((tree, passes))
    }

    fn restart_limit(&self, node: &AttemptRecord) -> u32 {
        node.config
            .as_ref()
            .and_then(|c| c.max_restarts)
            .unwrap_or(self.config.max_restarts)
    }

    pub fn schedule(&self) -> Result<TickReport> {
        let started_at = Utc::now().to_rfc3339();
        let (mut tree, reconcile_passes) = self.build_tree()?;
        let status_counts = tree.status_counts();
        let max_jobs = self.config.max_concurrent_jobs;
        let mut concurrent_jobs = tree
            .attempts()
            .filter(|n| n.status == Status::Run && n.cid.is_none())
            .count();

        let mut worklist: Vec<(i32, PathBuf)> = tree
            .attempts()
            .filter(|n| n.status != Status::Done)
            .map(|n| (n.niceness, n.path.clone()))
            .collect();
        worklist.sort_by_key(|(niceness, _)| *niceness);

        let mut actions = Vec::new();
        for (_, path) in worklist {
            let Some(node) = tree.by_path(&path) else {
                tracing::debug!(path = %path.display(), "attempt vanished during pass");
                continue;
            };
            let status = node.status;
            tracing::debug!(attempt_id = node.id, %status, "checking attempt");
            match status {
                Status::Run => {
                    if let Some(action) = self.backup(node) {
                        actions.push(action);
                    }
                }
                Status::Stall => {
                    tracing::warn!(
                        attempt_id = node.id,
                        path = %node.path.display(),
                        pid = ?node.pid,
                        "attempt stalled"
                    );
                    let action = match kill_attempt(node) {
                        Ok(killed) => TickAction::done(
                            ActionKind::Kill,
                            node,
                            (!killed).then(|| "process already gone".to_string()),
                        ),
                        Err(err) => TickAction::failed(ActionKind::Kill, node, &err),
                    };
                    actions.push(action);
                    tree = self.build_tree()?.0;
                }
                Status::Stop if node.level == 1 => {
                    let limit = self.restart_limit(node);
                    let restarts = tree.lineage_restart_count(node.id);
                    if restarts > limit as usize {
                        let reason = format!(
                            "restart limit exceeded: {} restarts, limit {}",
                            restarts, limit
                        );
                        actions.push(match mark_error(node, &reason) {
                            Ok(()) => TickAction::done(ActionKind::Escalate, node, Some(reason)),
                            Err(err) => TickAction::failed(ActionKind::Escalate, node, &err),
                        });
                    } else if concurrent_jobs < max_jobs {
                        let target = tree.restart_target(node.id).unwrap_or(node);
                        match restart_attempt(&tree, target.id, &self.checkpoints) {
                            Ok(dir) => {
                                concurrent_jobs += 1;
                                actions.push(TickAction::done(
                                    ActionKind::Restart,
                                    target,
                                    Some(dir.display().to_string()),
                                ));
                            }
                            Err(err) => {
                                actions.push(TickAction::failed(ActionKind::Restart, target, &err))
                            }
                        }
                    } else {
                        tracing::debug!(attempt_id = node.id, "no capacity for restart");
                    }
                }
                Status::New if !node.has_started() => {
                    if tree
                        .lineage_head(node.id)
                        .is_some_and(|head| head.error_marker)
                    {
                        tracing::debug!(attempt_id = node.id, "lineage marked failed, not starting");
                        continue;
                    }
                    if concurrent_jobs >= max_jobs {
                        tracing::debug!(attempt_id = node.id, "no capacity for start");
                        continue;
                    }
                    match start_attempt(node) {
                        Ok(pid) => {
                            concurrent_jobs += 1;
                            actions.push(TickAction::done(
                                ActionKind::Start,
                                node,
                                Some(format!("pid {}", pid)),
                            ));
                        }
                        Err(err) => actions.push(TickAction::failed(ActionKind::Start, node, &err)),
                    }
                }
                _ => {}
            }
        }

        tracing::info!(
            concurrent_jobs,
            max_concurrent_jobs = max_jobs,
            actions = actions.len(),
            "pass complete, load {}/{}",
            concurrent_jobs,
            max_jobs
        );
        Ok(TickReport {
            started_at,
            reconcile_passes,
            actions,
            concurrent_jobs,
            max_concurrent_jobs: max_jobs,
            status_counts,
        })
    }

    fn backup(&self, node: &AttemptRecord) -> Option<TickAction> {
        match self.checkpoints.backup(node) {
            Ok(BackupOutcome::Created { backup, pruned }) => {
                let detail = if pruned.is_empty() {
                    backup.display().to_string()
                } else {
                    format!("{} (pruned {})", backup.display(), pruned.len())
                };
                Some(TickAction::done(ActionKind::Backup, node, Some(detail)))
            }
            Ok(outcome) => {
                tracing::debug!(attempt_id = node.id, outcome = ?outcome, "no backup taken");
                None
            }
            Err(err) => Some(TickAction::failed(ActionKind::Backup, node, &err)),
        }
    }

    /// Runs passes separated by the poll interval. A failed pass is logged
    /// and the loop carries on. `max_ticks` of `None` never returns.
    pub fn run_loop(&self, max_ticks: Option<usize>, mut on_tick: impl FnMut(&TickReport)) {
        let mut tick = 0usize;
        loop {
            tick += 1;
            match self.schedule() {
                Ok(report) => on_tick(&report),
                Err(err) => tracing::error!(tick, error = ?err, "pass failed"),
            }
            if max_ticks.is_some_and(|max| tick >= max) {
                return;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    pub fn run_ticks(&self, ticks: usize) -> Vec<TickReport> {
        let mut reports = Vec::with_capacity(ticks);
        if ticks > 0 {
            self.run_loop(Some(ticks), |report| reports.push(report.clone()));
        }
        reports
    }

    pub fn run_forever(&self) {
        tracing::info!(
            root = %self.config.root_dir.display(),
            interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "supervisor started"
        );
        self.run_loop(None, |_| {});
    }
}
