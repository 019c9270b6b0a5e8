//! Status probing for a single attempt directory.
//!
//! Liveness, output activity and marker files are generic; extracting the
//! model time (and, for some codes, deciding completion) is delegated to a
//! [`StatusProbe`] chosen by the attempt's `Code_name`.

use crate::attempt::{AttemptConfig, AttemptRecord, Status, ERROR_MARKER};
use crate::epoch_seconds;
use crate::process::{is_alive, read_pid_marker};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, OnceLock};

const TAIL_WINDOW_BYTES: u64 = 8 * 1024;

pub trait StatusProbe: Send + Sync {
    /// Current model time, or `None` when nothing can be read yet.
    fn model_time(&self, dir: &Path, config: &AttemptConfig) -> Result<Option<f64>>;

    /// File whose modification time counts as output activity.
    fn output_file<'a>(&self, config: &'a AttemptConfig) -> Option<&'a str> {
        config.output_file.as_deref()
    }

    fn is_complete(&self, _dir: &Path, config: &AttemptConfig, t: f64) -> bool {
        config.t_end > 0.0 && t >= config.t_end
    }
}

/// Takes the first number on the last non-empty line of the output file.
#[derive(Debug, Default)]
pub struct TailLineProbe;

impl StatusProbe for TailLineProbe {
    fn model_time(&self, dir: &Path, config: &AttemptConfig) -> Result<Option<f64>> {
        let Some(output) = config.output_file.as_deref() else {
            return Ok(None);
        };
        let path = dir.join(output);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(last_nonempty_line(&path)?.and_then(|line| first_number(&line)))
    }
}

/// Scans the whole log for `T = <number>` lines and keeps the largest value.
#[derive(Debug, Default)]
pub struct Nbody6Probe;

impl StatusProbe for Nbody6Probe {
    fn model_time(&self, dir: &Path, config: &AttemptConfig) -> Result<Option<f64>> {
        let Some(output) = self.output_file(config) else {
            return Ok(None);
        };
        let path = dir.join(output);
        if !path.is_file() {
            return Ok(None);
        }
        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let Some(re) = nbody_time_regex() else {
            return Ok(None);
        };
        let mut reader = BufReader::new(file);
        let mut raw = Vec::new();
        let mut best: Option<f64> = None;
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            // the log mixes in binary diagnostics; decode lossily
            let line = String::from_utf8_lossy(&raw);
            if let Some(caps) = re.captures(&line) {
                if let Ok(t) = caps[1].parse::<f64>() {
                    best = Some(best.map_or(t, |b| b.max(t)));
                }
            }
        }
        Ok(best)
    }

    fn output_file<'a>(&self, config: &'a AttemptConfig) -> Option<&'a str> {
        Some(config.output_file.as_deref().unwrap_or("output.log"))
    }
}

/// Tail-line model time; a result archive (`*.hdf5`) also marks completion.
#[derive(Debug, Default)]
pub struct ArchiveProbe;

impl StatusProbe for ArchiveProbe {
    fn model_time(&self, dir: &Path, config: &AttemptConfig) -> Result<Option<f64>> {
        TailLineProbe.model_time(dir, config)
    }

    fn is_complete(&self, dir: &Path, config: &AttemptConfig, t: f64) -> bool {
        has_result_archive(dir) || (config.t_end > 0.0 && t >= config.t_end)
    }
}

fn has_result_archive(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.path().extension().and_then(|x| x.to_str()) == Some("hdf5")
                    && e.file_type().map(|t| t.is_file()).unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: BTreeMap<String, Arc<dyn StatusProbe>>,
}

impl ProbeRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("Generic", TailLineProbe);
        registry.register("DemoSimulation", TailLineProbe);
        registry.register("Nbody6", Nbody6Probe);
        registry.register("LonelyPlanets", ArchiveProbe);
        registry
    }

    pub fn register(&mut self, code_name: &str, probe: impl StatusProbe + 'static) {
        self.probes.insert(code_name.to_string(), Arc::new(probe));
    }

    pub fn get(&self, code_name: &str) -> Option<&dyn StatusProbe> {
        self.probes.get(code_name).map(|p| p.as_ref())
    }

    pub fn contains(&self, code_name: &str) -> bool {
        self.probes.contains_key(code_name)
    }

    pub fn code_names(&self) -> impl Iterator<Item = &str> {
        self.probes.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.probes.keys()).finish()
    }
}

/// Inputs of the status decision, gathered from disk and the process table.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub alive: bool,
    pub idle_seconds: f64,
    pub stall_threshold: f64,
    pub complete: bool,
    pub error_marker: bool,
    pub started: bool,
}

pub fn classify(obs: Observation) -> Status {
    if obs.alive {
        if obs.idle_seconds > obs.stall_threshold {
            Status::Stall
        } else {
            Status::Run
        }
    } else if obs.complete {
        Status::Done
    } else if obs.error_marker {
        Status::Error
    } else if !obs.started {
        Status::New
    } else {
        Status::Stop
    }
}

/// Fills `t`, `mtime`, `ctime`, `pid`, `error_marker` and `status` of `record`.
/// Reads only; never touches the filesystem.
pub fn probe_attempt(
    record: &mut AttemptRecord,
    probe: &dyn StatusProbe,
    default_stall_time: f64,
    now: f64,
) {
    let Some(config) = record.config.as_ref() else {
        return;
    };
    let dir = record.path.as_path();

    match probe.model_time(dir, config) {
        Ok(Some(t)) => record.t = t,
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(path = %dir.display(), error = %err, "failed to read model time");
        }
    }
    if let Some(output) = probe.output_file(config) {
        if let Ok(modified) = fs::metadata(dir.join(output)).and_then(|m| m.modified()) {
            record.mtime = epoch_seconds(modified);
        }
    }
    record.ctime = config.timestamp_started;
    record.pid = read_pid_marker(dir).or(config.pid);
    record.error_marker = dir.join(ERROR_MARKER).is_file();

    let obs = Observation {
        alive: record.pid.map(is_alive).unwrap_or(false),
        // no output yet: idle since launch
        idle_seconds: now - record.mtime.max(record.ctime),
        stall_threshold: config.stall_time.unwrap_or(default_stall_time),
        complete: probe.is_complete(dir, config, record.t),
        error_marker: record.error_marker,
        started: record.ctime > 0.0,
    };
    record.status = classify(obs);
}

fn last_nonempty_line(path: &Path) -> Result<Option<String>> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    Ok(text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string))
}

/// Last `max_lines` lines of `path`, reading backwards one window at a time.
pub(crate) fn tail_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut start = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();
    while start > 0 && buf.iter().filter(|b| **b == b'\n').count() <= max_lines {
        let next = start.saturating_sub(TAIL_WINDOW_BYTES);
        let mut chunk = vec![0u8; (start - next) as usize];
        file.seek(SeekFrom::Start(next))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        start = next;
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    if start > 0 && !lines.is_empty() {
        // first line of the window may be cut
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

fn first_number(line: &str) -> Option<f64> {
    number_regex()?
        .find(line)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn number_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").ok())
        .as_ref()
}

fn nbody_time_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*T\s*=\s*([-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)").ok())
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::{AttemptConfig, PID_MARKER};
    use crate::now_epoch_seconds;
    use crate::test_support::{set_mtime, temp_root, DEAD_PID};

    fn obs() -> Observation {
        Observation {
            alive: false,
            idle_seconds: 0.0,
            stall_threshold: 300.0,
            complete: false,
            error_marker: false,
            started: true,
        }
    }

    #[test]
    fn classify_follows_liveness_then_markers() {
        assert_eq!(classify(Observation { alive: true, ..obs() }), Status::Run);
        assert_eq!(
            classify(Observation {
                alive: true,
                idle_seconds: 301.0,
                ..obs()
            }),
            Status::Stall
        );
        assert_eq!(
            classify(Observation {
                complete: true,
                error_marker: true,
                ..obs()
            }),
            Status::Done
        );
        assert_eq!(
            classify(Observation {
                error_marker: true,
                ..obs()
            }),
            Status::Error
        );
        assert_eq!(
            classify(Observation {
                started: false,
                ..obs()
            }),
            Status::New
        );
        assert_eq!(classify(obs()), Status::Stop);
    }

    #[test]
    fn tail_probe_reads_first_number_of_last_line() {
        let root = temp_root("tail_probe");
        fs::write(root.join("output.txt"), "0.000000, 0.1\n12.500000, 0.3\n\n").expect("write");
        let cfg = AttemptConfig {
            output_file: Some("output.txt".to_string()),
            ..AttemptConfig::default()
        };
        assert_eq!(TailLineProbe.model_time(&root, &cfg).expect("probe"), Some(12.5));
        let missing = AttemptConfig {
            output_file: Some("nope.txt".to_string()),
            ..AttemptConfig::default()
        };
        assert_eq!(TailLineProbe.model_time(&root, &missing).expect("probe"), None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nbody6_probe_returns_largest_time() {
        let root = temp_root("nbody_probe");
        let log = " T = 10, N = 100\n ADJUST: T = 99 ignored\n T =   40  NSTEPS\n T = 25\n";
        fs::write(root.join("output.log"), log).expect("write");
        let cfg = AttemptConfig::default();
        assert_eq!(Nbody6Probe.model_time(&root, &cfg).expect("probe"), Some(40.0));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn archive_probe_completes_on_result_file() {
        let root = temp_root("archive_probe");
        let cfg = AttemptConfig {
            t_end: 100.0,
            ..AttemptConfig::default()
        };
        assert!(!ArchiveProbe.is_complete(&root, &cfg, 3.0));
        fs::write(root.join("snapshot.hdf5"), b"").expect("write");
        assert!(ArchiveProbe.is_complete(&root, &cfg, 3.0));
        let _ = fs::remove_dir_all(root);
    }

    fn demo_record(dir: &Path, cfg: AttemptConfig) -> AttemptRecord {
        AttemptRecord::from_config(1, dir, 0, 1, cfg)
    }

    #[test]
    fn dead_process_at_target_time_is_done() {
        let root = temp_root("probe_done");
        fs::write(root.join("output.txt"), "29.0\n30.0\n").expect("write");
        fs::write(root.join(PID_MARKER), format!("{}\n", DEAD_PID)).expect("write");
        let cfg = AttemptConfig {
            code_name: "DemoSimulation".to_string(),
            output_file: Some("output.txt".to_string()),
            t_end: 30.0,
            timestamp_started: 1.0,
            ..AttemptConfig::default()
        };
        let mut rec = demo_record(&root, cfg);
        probe_attempt(&mut rec, &TailLineProbe, 7200.0, now_epoch_seconds());
        assert_eq!(rec.t, 30.0);
        assert_eq!(rec.pid, Some(DEAD_PID));
        assert_eq!(rec.status, Status::Done);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn live_process_with_old_output_is_stalled() {
        let root = temp_root("probe_stall");
        let output = root.join("output.txt");
        fs::write(&output, "5\n").expect("write");
        set_mtime(&output, 10_000);
        fs::write(root.join(PID_MARKER), format!("{}\n", std::process::id())).expect("write");
        let cfg = AttemptConfig {
            code_name: "DemoSimulation".to_string(),
            output_file: Some("output.txt".to_string()),
            stall_time: Some(7200.0),
            t_end: 30.0,
            timestamp_started: 1.0,
            ..AttemptConfig::default()
        };
        let mut rec = demo_record(&root, cfg.clone());
        probe_attempt(&mut rec, &TailLineProbe, 300.0, now_epoch_seconds());
        assert_eq!(rec.status, Status::Stall);

        set_mtime(&output, 10);
        let mut fresh = demo_record(&root, cfg);
        probe_attempt(&mut fresh, &TailLineProbe, 300.0, now_epoch_seconds());
        assert_eq!(fresh.status, Status::Run);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_output_keeps_start_time_and_reports_new() {
        let root = temp_root("probe_new");
        let cfg = AttemptConfig {
            code_name: "DemoSimulation".to_string(),
            output_file: Some("output.txt".to_string()),
            t_start: 4.0,
            t_end: 30.0,
            ..AttemptConfig::default()
        };
        let mut rec = demo_record(&root, cfg);
        probe_attempt(&mut rec, &TailLineProbe, 300.0, now_epoch_seconds());
        assert_eq!(rec.t, 4.0);
        assert_eq!(rec.status, Status::New);

        fs::write(root.join(ERROR_MARKER), "restart limit reached\n").expect("write");
        probe_attempt(&mut rec, &TailLineProbe, 300.0, now_epoch_seconds());
        assert_eq!(rec.status, Status::Error);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn freshly_started_process_without_output_is_running() {
        let root = temp_root("probe_fresh");
        fs::write(root.join(PID_MARKER), format!("{}\n", std::process::id())).expect("write");
        let now = now_epoch_seconds();
        let cfg = AttemptConfig {
            code_name: "DemoSimulation".to_string(),
            output_file: Some("output.txt".to_string()),
            stall_time: Some(7200.0),
            t_end: 30.0,
            timestamp_started: now - 5.0,
            ..AttemptConfig::default()
        };
        let mut rec = demo_record(&root, cfg.clone());
        probe_attempt(&mut rec, &TailLineProbe, 7200.0, now);
        assert_eq!(rec.mtime, 0.0);
        assert_eq!(rec.status, Status::Run);

        let mut later = demo_record(&root, cfg);
        probe_attempt(&mut later, &TailLineProbe, 7200.0, now + 8000.0);
        assert_eq!(later.status, Status::Stall);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nbody6_activity_uses_default_log() {
        let root = temp_root("nbody_activity");
        let log = root.join("output.log");
        fs::write(&log, " T = 3\n").expect("write");
        set_mtime(&log, 10);
        fs::write(root.join(PID_MARKER), format!("{}\n", std::process::id())).expect("write");
        let cfg = AttemptConfig {
            code_name: "Nbody6".to_string(),
            stall_time: Some(300.0),
            t_end: 30.0,
            timestamp_started: 1.0,
            ..AttemptConfig::default()
        };
        let mut rec = demo_record(&root, cfg);
        probe_attempt(&mut rec, &Nbody6Probe, 300.0, now_epoch_seconds());
        assert_eq!(rec.t, 3.0);
        assert!(rec.mtime > 1.0);
        assert_eq!(rec.status, Status::Run);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nbody6_log_with_binary_noise_still_reports_time() {
        let root = temp_root("nbody_binary");
        fs::write(
            root.join("output.log"),
            b" T = 10\n\xff\xfe\x00 garbage\n T = 30\n".as_slice(),
        )
        .expect("write");
        fs::write(root.join(PID_MARKER), format!("{}\n", DEAD_PID)).expect("write");
        let cfg = AttemptConfig {
            code_name: "Nbody6".to_string(),
            t_end: 30.0,
            timestamp_started: 1.0,
            ..AttemptConfig::default()
        };
        assert_eq!(Nbody6Probe.model_time(&root, &cfg).expect("read"), Some(30.0));
        let mut rec = demo_record(&root, cfg);
        probe_attempt(&mut rec, &Nbody6Probe, 7200.0, now_epoch_seconds());
        assert_eq!(rec.status, Status::Done);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn tail_lines_crosses_window_boundaries() {
        let root = temp_root("tail_lines");
        let path = root.join("big.txt");
        let text: String = (0..5000).map(|i| format!("line {}\n", i)).collect();
        fs::write(&path, &text).expect("write");
        let tail = tail_lines(&path, 3).expect("tail");
        assert_eq!(tail, ["line 4997", "line 4998", "line 4999"]);
        let many = tail_lines(&path, 2000).expect("tail");
        assert_eq!(many.len(), 2000);
        assert_eq!(many[0], "line 3000");
        let all = tail_lines(&path, 10_000).expect("tail");
        assert_eq!(all.len(), 5000);
        assert_eq!(all[0], "line 0");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn registry_lists_builtin_code_names() {
        let registry = ProbeRegistry::with_builtins();
        let names: Vec<&str> = registry.code_names().collect();
        assert_eq!(names, ["DemoSimulation", "Generic", "LonelyPlanets", "Nbody6"]);
        assert!(registry.get("Unknown").is_none());
    }
}
