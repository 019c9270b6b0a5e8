use crate::conf::{ConfDocument, ConfError};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "simwatch.conf";
pub const CONFIG_SECTION: &str = "Simulation";
/// Written by the spawn wrapper with the PID of the launched command.
pub const PID_MARKER: &str = ".process.pid";
/// Advisory stop request, polled by the simulation code itself.
pub const STOP_MARKER: &str = "STOP";
/// Permanent failure: the lineage is never restarted again.
pub const ERROR_MARKER: &str = "ERROR";
pub const RESTART_DIR_PREFIX: &str = "restart";

pub type AttemptId = usize;

pub const ROOT_ID: AttemptId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    New,
    Stop,
    Run,
    Stall,
    Done,
    Error,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::New,
        Status::Stop,
        Status::Run,
        Status::Stall,
        Status::Done,
        Status::Error,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Stop => "STOP",
            Status::Run => "RUN",
            Status::Stall => "STALL",
            Status::Done => "DONE",
            Status::Error => "ERROR",
        }
    }

    /// DONE and ERROR have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptConfig {
    pub code_name: String,
    pub input_file: Option<String>,
    pub output_file: Option<String>,
    pub error_file: Option<String>,
    pub restart_file: Option<String>,
    pub timestamp_started: f64,
    pub timestamp_last_updated: f64,
    pub stall_time: Option<f64>,
    pub t_start: f64,
    pub t_end: f64,
    pub pid: Option<i32>,
    pub niceness: i32,
    pub start_command: Option<String>,
    pub restart_command: Option<String>,
    pub stop_command: Option<String>,
    pub max_restarts: Option<u32>,
    pub max_checkpoints: Option<u32>,
}

impl AttemptConfig {
    pub fn from_document(doc: &ConfDocument) -> Result<Self, ConfError> {
        let s = CONFIG_SECTION;
        doc.require_section(s)?;
        let code_name = doc.get_str(s, "Code_name").ok_or_else(|| ConfError::MissingKey {
            path: doc.origin().to_path_buf(),
            section: s.to_string(),
            key: "Code_name".to_string(),
        })?;
        Ok(Self {
            code_name,
            input_file: doc.get_str(s, "Input_file"),
            output_file: doc.get_str(s, "Output_file"),
            error_file: doc.get_str(s, "Error_file"),
            restart_file: doc.get_str(s, "Restart_file"),
            timestamp_started: doc.get_parsed(s, "Timestamp_started", "timestamp")?.unwrap_or(0.0),
            timestamp_last_updated: doc
                .get_parsed(s, "Timestamp_last_updated", "timestamp")?
                .unwrap_or(0.0),
            stall_time: doc.get_parsed(s, "Stall_time", "number of seconds")?,
            t_start: doc.get_parsed(s, "T_start", "model time")?.unwrap_or(0.0),
            t_end: doc.get_parsed(s, "T_end", "model time")?.unwrap_or(0.0),
            pid: doc.get_parsed::<i32>(s, "PID", "process id")?.filter(|p| *p > 0),
            niceness: doc.get_parsed(s, "Niceness", "integer")?.unwrap_or(0),
            start_command: doc.get_str(s, "Start_command"),
            restart_command: doc.get_str(s, "Restart_command"),
            stop_command: doc.get_str(s, "Stop_command"),
            max_restarts: doc.get_parsed(s, "Max_restarts", "non-negative integer")?,
            max_checkpoints: doc.get_parsed(s, "Maximum_n_checkpoints", "non-negative integer")?,
        })
    }

    pub fn load(dir: &Path) -> Result<Option<Self>, ConfError> {
        match ConfDocument::load_optional(&dir.join(CONFIG_FILE))? {
            Some(doc) => Self::from_document(&doc).map(Some),
            None => Ok(None),
        }
    }
}

/// One node of the attempt tree, rebuilt from disk on every pass.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub id: AttemptId,
    pub name: String,
    pub path: PathBuf,
    pub status: Status,
    pub t: f64,
    pub t_min: f64,
    pub t_max: f64,
    pub t_max_extended: f64,
    pub mtime: f64,
    pub ctime: f64,
    pub level: usize,
    pub parent_id: Option<AttemptId>,
    /// Nominated restart candidate among the direct children.
    pub cid: Option<AttemptId>,
    pub niceness: i32,
    pub restarts: Vec<AttemptId>,
    pub pid: Option<i32>,
    pub error_marker: bool,
    #[serde(skip)]
    pub config: Option<AttemptConfig>,
}

impl AttemptRecord {
    pub fn root(path: &Path) -> Self {
        Self {
            id: ROOT_ID,
            name: "root".to_string(),
            path: path.to_path_buf(),
            status: Status::New,
            t: 0.0,
            t_min: 0.0,
            t_max: 0.0,
            t_max_extended: 0.0,
            mtime: 0.0,
            ctime: 0.0,
            level: 0,
            parent_id: None,
            cid: None,
            niceness: 0,
            restarts: Vec::new(),
            pid: None,
            error_marker: false,
            config: None,
        }
    }

    pub fn from_config(
        id: AttemptId,
        path: &Path,
        parent_id: AttemptId,
        level: usize,
        config: AttemptConfig,
    ) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            id,
            name,
            path: path.to_path_buf(),
            status: Status::New,
            t: config.t_start,
            t_min: config.t_start,
            t_max: config.t_end,
            t_max_extended: config.t_end,
            mtime: 0.0,
            ctime: config.timestamp_started,
            level,
            parent_id: Some(parent_id),
            cid: None,
            niceness: config.niceness,
            restarts: Vec::new(),
            pid: None,
            error_marker: false,
            config: Some(config),
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub fn has_started(&self) -> bool {
        self.ctime > 0.0
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.file(CONFIG_FILE)
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.config
            .as_ref()
            .and_then(|c| c.output_file.as_deref())
            .map(|f| self.file(f))
    }

    pub fn restart_file_path(&self) -> Option<PathBuf> {
        self.config
            .as_ref()
            .and_then(|c| c.restart_file.as_deref())
            .map(|f| self.file(f))
    }

    pub fn progress(&self) -> f64 {
        if self.t_max > 0.0 {
            (self.t / self.t_max).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}
