//! Discovery of the attempt forest below a root directory.
//!
//! Ids are assigned in preorder, so a parent always has a smaller id than
//! any of its descendants and a reverse scan visits children first.

use crate::attempt::{AttemptConfig, AttemptId, AttemptRecord, Status, ROOT_ID};
use crate::now_epoch_seconds;
use crate::probe::{probe_attempt, ProbeRegistry};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct AttemptTree {
    root_dir: PathBuf,
    built_at: f64,
    nodes: Vec<AttemptRecord>,
}

impl AttemptTree {
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn built_at(&self) -> f64 {
        self.built_at
    }

    pub fn root(&self) -> &AttemptRecord {
        &self.nodes[ROOT_ID]
    }

    pub fn get(&self, id: AttemptId) -> Option<&AttemptRecord> {
        self.nodes.get(id)
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [AttemptRecord] {
        &mut self.nodes
    }

    pub fn by_path(&self, path: &Path) -> Option<&AttemptRecord> {
        self.nodes.iter().find(|n| n.path == path)
    }

    pub fn children(&self, id: AttemptId) -> impl Iterator<Item = &AttemptRecord> + '_ {
        self.nodes
            .get(id)
            .map(|n| n.restarts.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.nodes.get(*child))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttemptRecord> + '_ {
        self.nodes.iter()
    }

    pub fn attempts(&self) -> impl Iterator<Item = &AttemptRecord> + '_ {
        self.nodes.iter().filter(|n| !n.is_root())
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nested restart attempts anywhere below `id`.
    pub fn lineage_restart_count(&self, id: AttemptId) -> usize {
        self.children(id)
            .map(|child| 1 + self.lineage_restart_count(child.id))
            .sum()
    }

    /// End of the nominated-candidate chain starting at `id`.
    pub fn restart_target(&self, id: AttemptId) -> Option<&AttemptRecord> {
        let mut node = self.nodes.get(id)?;
        while let Some(next) = node.cid.and_then(|cid| self.nodes.get(cid)) {
            node = next;
        }
        Some(node)
    }

    /// Top-level attempt (level 1) that `id` belongs to.
    pub fn lineage_head(&self, id: AttemptId) -> Option<&AttemptRecord> {
        let mut node = self.nodes.get(id)?;
        while let Some(parent) = node
            .parent_id
            .filter(|p| *p != ROOT_ID)
            .and_then(|p| self.nodes.get(p))
        {
            node = parent;
        }
        (!node.is_root()).then_some(node)
    }

    pub fn status_counts(&self) -> BTreeMap<Status, usize> {
        let mut counts = BTreeMap::new();
        for node in self.attempts() {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> AttemptSnapshot {
        self.snapshot_node(self.root())
    }

    fn snapshot_node(&self, node: &AttemptRecord) -> AttemptSnapshot {
        AttemptSnapshot {
            id: node.id,
            name: node.name.clone(),
            path: node.path.clone(),
            code_name: node.config.as_ref().map(|c| c.code_name.clone()),
            status: node.status,
            t: node.t,
            t_max: node.t_max,
            t_max_extended: node.t_max_extended,
            progress: node.progress(),
            mtime: node.mtime,
            ctime: node.ctime,
            level: node.level,
            cid: node.cid,
            niceness: node.niceness,
            pid: node.pid,
            restarts: self
                .children(node.id)
                .map(|child| self.snapshot_node(child))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSnapshot {
    pub id: AttemptId,
    pub name: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_name: Option<String>,
    pub status: Status,
    pub t: f64,
    pub t_max: f64,
    pub t_max_extended: f64,
    pub progress: f64,
    pub mtime: f64,
    pub ctime: f64,
    pub level: usize,
    pub cid: Option<AttemptId>,
    pub niceness: i32,
    pub pid: Option<i32>,
    pub restarts: Vec<AttemptSnapshot>,
}

pub struct TreeBuilder<'a> {
    registry: &'a ProbeRegistry,
    stall_time: f64,
}

impl<'a> TreeBuilder<'a> {
    /// `stall_time` applies to attempts without their own `Stall_time`.
    pub fn new(registry: &'a ProbeRegistry, stall_time: f64) -> Self {
        Self {
            registry,
            stall_time,
        }
    }

    pub fn build(&self, root: &Path) -> Result<AttemptTree> {
        self.build_at(root, now_epoch_seconds())
    }

    pub fn build_at(&self, root: &Path, now: f64) -> Result<AttemptTree> {
        if !root.is_dir() {
            return Err(anyhow!("root directory not found: {}", root.display()));
        }
        let mut nodes = vec![AttemptRecord::root(root)];
        // (depth, id) of the attempt directories enclosing the current entry
        let mut enclosing: Vec<(usize, AttemptId)> = vec![(0, ROOT_ID)];

        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            let config = match AttemptConfig::load(dir) {
                Ok(Some(config)) => config,
                Ok(None) => {
                    walker.skip_current_dir();
                    continue;
                }
                Err(err) => {
                    tracing::warn!(path = %dir.display(), error = %err, "skipping attempt with unreadable config");
                    walker.skip_current_dir();
                    continue;
                }
            };
            let Some(probe) = self.registry.get(&config.code_name) else {
                tracing::debug!(
                    path = %dir.display(),
                    code_name = %config.code_name,
                    "skipping attempt with unregistered code"
                );
                walker.skip_current_dir();
                continue;
            };

            let depth = entry.depth();
            while enclosing.last().is_some_and(|(d, _)| *d >= depth) {
                enclosing.pop();
            }
            let parent_id = enclosing.last().map(|(_, id)| *id).unwrap_or(ROOT_ID);
            let id = nodes.len();
            let mut record = AttemptRecord::from_config(id, dir, parent_id, depth, config);
            probe_attempt(&mut record, probe, self.stall_time, now);
            tracing::debug!(
                attempt_id = id,
                path = %dir.display(),
                status = %record.status,
                t = record.t,
                "probed attempt"
            );

            let status = record.status;
            nodes.push(record);
            enclosing.push((depth, id));
            let parent = &mut nodes[parent_id];
            parent.restarts.push(id);
            if !parent.is_root() && !parent.status.is_terminal() {
                parent.status = status;
            }
        }

        nominate_candidates(&mut nodes);
        fold_extended_targets(&mut nodes);

        Ok(AttemptTree {
            root_dir: root.to_path_buf(),
            built_at: now,
            nodes,
        })
    }
}

fn nominate_candidates(nodes: &mut [AttemptRecord]) {
    for id in 1..nodes.len() {
        let parent_t = nodes[id].t;
        let mut best: Option<(bool, f64, AttemptId)> = None;
        for &child_id in &nodes[id].restarts {
            let child = &nodes[child_id];
            let running = child.status == Status::Run;
            let eligible = (child.t > parent_t && !child.error_marker) || running;
            if !eligible {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_running, best_t, _)) => {
                    (running && !best_running) || (running == best_running && child.t > best_t)
                }
            };
            if better {
                best = Some((running, child.t, child_id));
            }
        }
        nodes[id].cid = best.map(|(_, _, child_id)| child_id);
    }
}

fn fold_extended_targets(nodes: &mut [AttemptRecord]) {
    for id in (1..nodes.len()).rev() {
        let Some(parent_id) = nodes[id].parent_id else {
            continue;
        };
        let extended = nodes[id].t_max_extended;
        let parent = &mut nodes[parent_id];
        if extended > parent.t_max_extended {
            parent.t_max_extended = extended;
        }
    }
}
