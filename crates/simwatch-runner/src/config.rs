use crate::conf::{ConfDocument, ConfError};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DAEMON_SECTION: &str = "Daemon";

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 180;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;
pub const DEFAULT_MAX_RESTARTS: u32 = 2;
pub const DEFAULT_STALL_TIME: f64 = 7200.0;
pub const DEFAULT_MAX_CHECKPOINTS: u32 = 20;

/// Global settings from the `[Daemon]` section of the daemon's config file.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub root_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    /// Lineage restart cap for attempts without their own `Max_restarts`.
    pub max_restarts: u32,
    pub stall_time: f64,
    /// Backup retention; 0 keeps every backup.
    pub max_checkpoints: u32,
    pub log_level: String,
}

impl DaemonConfig {
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            stall_time: DEFAULT_STALL_TIME,
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            log_level: "info".to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfError> {
        Self::from_document(&ConfDocument::load(path)?)
    }

    /// A relative `Root_dir` resolves against the directory holding the
    /// config file.
    pub fn from_document(doc: &ConfDocument) -> Result<Self, ConfError> {
        let s = DAEMON_SECTION;
        doc.require_section(s)?;
        let root = doc.get_str(s, "Root_dir").ok_or_else(|| ConfError::MissingKey {
            path: doc.origin().to_path_buf(),
            section: s.to_string(),
            key: "Root_dir".to_string(),
        })?;
        let root = PathBuf::from(root);
        let root_dir = if root.is_relative() {
            doc.origin()
                .parent()
                .map(|base| base.join(&root))
                .unwrap_or(root)
        } else {
            root
        };

        let mut cfg = Self::with_root(root_dir);
        if let Some(secs) = doc.get_parsed::<u64>(s, "Poll_interval", "number of seconds")? {
            cfg.poll_interval = Duration::from_secs(secs);
        }
        if let Some(jobs) = doc.get_parsed(s, "Max_concurrent_jobs", "non-negative integer")? {
            cfg.max_concurrent_jobs = jobs;
        }
        if let Some(restarts) = doc.get_parsed(s, "Max_restarts", "non-negative integer")? {
            cfg.max_restarts = restarts;
        }
        if let Some(stall) = doc.get_parsed::<f64>(s, "Stall_time", "number of seconds")? {
            if !stall.is_finite() || stall < 0.0 {
                return Err(ConfError::InvalidValue {
                    path: doc.origin().to_path_buf(),
                    section: s.to_string(),
                    key: "Stall_time".to_string(),
                    value: stall.to_string(),
                    expected: "non-negative number of seconds",
                });
            }
            cfg.stall_time = stall;
        }
        if let Some(keep) = doc.get_parsed(s, "Maximum_n_checkpoints", "non-negative integer")? {
            cfg.max_checkpoints = keep;
        }
        if let Some(level) = doc.get_str(s, "Log_level") {
            cfg.log_level = level;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<DaemonConfig, ConfError> {
        let doc = ConfDocument::parse(text, Path::new("/srv/sims/simwatch.conf"))?;
        DaemonConfig::from_document(&doc)
    }

    #[test]
    fn defaults_fill_unset_keys() {
        let cfg = parse("[Daemon]\nRoot_dir = /data/runs\n").expect("config");
        assert_eq!(cfg, DaemonConfig::with_root("/data/runs"));
        assert_eq!(cfg.poll_interval, Duration::from_secs(180));
        assert_eq!(cfg.max_concurrent_jobs, 2);
        assert_eq!(cfg.max_checkpoints, 20);
    }

    #[test]
    fn relative_root_resolves_next_to_the_config_file() {
        let cfg = parse(
            "[Daemon]\nRoot_dir = runs\nPoll_interval = 5\nMax_concurrent_jobs = 4\nStall_time = 60\nLog_level = WARNING\n",
        )
        .expect("config");
        assert_eq!(cfg.root_dir, PathBuf::from("/srv/sims/runs"));
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_concurrent_jobs, 4);
        assert_eq!(cfg.stall_time, 60.0);
        assert_eq!(cfg.log_level, "WARNING");
    }

    #[test]
    fn root_dir_is_required_and_values_are_checked() {
        let err = parse("[Daemon]\nPoll_interval = 5\n").expect_err("no root");
        assert!(matches!(err, ConfError::MissingKey { ref key, .. } if key == "Root_dir"));
        let err = parse("[Daemon]\nRoot_dir = /x\nMax_concurrent_jobs = two\n").expect_err("bad jobs");
        assert!(matches!(err, ConfError::InvalidValue { ref key, .. } if key == "Max_concurrent_jobs"));
        let err = parse("[Daemon]\nRoot_dir = /x\nStall_time = -1\n").expect_err("bad stall");
        assert!(matches!(err, ConfError::InvalidValue { ref key, .. } if key == "Stall_time"));
        let err = parse("[Other]\nRoot_dir = /x\n").expect_err("no section");
        assert!(matches!(err, ConfError::MissingSection { .. }));
    }
}
