use simwatch_runner::attempt::{CONFIG_FILE, PID_MARKER};
use simwatch_runner::process::{is_alive, kill};
use simwatch_runner::{ActionKind, AttemptConfig, DaemonConfig, Status, Supervisor};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

const DEAD_PID: i32 = 999_999_999;

fn write_attempt(dir: &Path, fields: &[(&str, String)]) {
    fs::create_dir_all(dir).expect("attempt dir");
    let mut text = String::from("[Simulation]\nCode_name = DemoSimulation\nOutput_file = output.txt\n");
    for (key, value) in fields {
        text.push_str(&format!("{} = {}\n", key, value));
    }
    fs::write(dir.join(CONFIG_FILE), text).expect("conf");
}

fn write_output(dir: &Path, t: f64) {
    fs::write(dir.join("output.txt"), format!("0.0\n{}\n", t)).expect("output");
}

fn write_pid(dir: &Path, pid: i32) {
    fs::write(dir.join(PID_MARKER), format!("{}\n", pid)).expect("pid");
}

fn age(path: &Path, seconds: u64) {
    let file = fs::File::options().write(true).open(path).expect("open");
    file.set_modified(SystemTime::now() - Duration::from_secs(seconds))
        .expect("mtime");
}

fn supervisor(root: &Path, max_jobs: usize) -> Supervisor {
    let mut cfg = DaemonConfig::with_root(root);
    cfg.max_concurrent_jobs = max_jobs;
    cfg.poll_interval = Duration::from_millis(10);
    Supervisor::new(cfg)
}

fn started(fields: &mut Vec<(&'static str, String)>) {
    fields.push(("Timestamp_started", "1700000000".to_string()));
}

#[test]
fn attempt_at_target_with_dead_process_is_done_and_left_alone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("sim");
    let mut fields = vec![("T_end", "30".to_string())];
    started(&mut fields);
    write_attempt(&dir, &fields);
    write_output(&dir, 30.0);
    write_pid(&dir, DEAD_PID);

    let sup = supervisor(tmp.path(), 2);
    let report = sup.schedule().expect("pass");
    assert!(report.actions.is_empty(), "{:?}", report.actions);
    assert_eq!(report.status_counts.get(&Status::Done), Some(&1));
    let (tree, _) = sup.build_tree().expect("tree");
    assert_eq!(tree.by_path(&dir).map(|n| n.status), Some(Status::Done));
}

#[test]
fn stalled_attempt_is_killed_and_then_seen_as_stopped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("sim");
    let mut fields = vec![
        ("T_end", "30".to_string()),
        ("Stall_time", "7200".to_string()),
    ];
    started(&mut fields);
    write_attempt(&dir, &fields);
    write_output(&dir, 5.0);
    age(&dir.join("output.txt"), 10_000);

    let mut child = Command::new("sleep")
        .arg("60")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sleep");
    let pid = child.id() as i32;
    write_pid(&dir, pid);

    let sup = supervisor(tmp.path(), 2);
    let (before, _) = sup.build_tree().expect("tree");
    assert_eq!(before.by_path(&dir).map(|n| n.status), Some(Status::Stall));

    let report = sup.schedule().expect("pass");
    let kills: Vec<_> = report.actions_of(ActionKind::Kill).collect();
    assert_eq!(kills.len(), 1);
    assert!(kills[0].ok);
    assert_eq!(kills[0].path, dir);
    assert_eq!(report.actions_of(ActionKind::Restart).count(), 0);

    child.wait().expect("reap killed child");
    assert!(!is_alive(pid));
    let (after, _) = sup.build_tree().expect("tree");
    assert_eq!(after.by_path(&dir).map(|n| n.status), Some(Status::Stop));
}

#[test]
fn stopped_lineage_restarts_its_most_advanced_child() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let head = tmp.path().join("sim");
    let child = head.join("restart1");
    for (dir, t) in [(&head, 10.0), (&child, 12.0)] {
        let mut fields = vec![
            ("T_end", "30".to_string()),
            ("Restart_command", "sleep 30".to_string()),
        ];
        started(&mut fields);
        write_attempt(dir, &fields);
        write_output(dir, t);
        write_pid(dir, DEAD_PID);
    }

    let sup = supervisor(tmp.path(), 2);
    let (tree, _) = sup.build_tree().expect("tree");
    let head_node = tree.by_path(&head).expect("head");
    let child_node = tree.by_path(&child).expect("child");
    assert_eq!(head_node.status, Status::Stop);
    assert_eq!(head_node.cid, Some(child_node.id));

    let report = sup.schedule().expect("pass");
    let restarts: Vec<_> = report.actions_of(ActionKind::Restart).collect();
    assert_eq!(restarts.len(), 1, "{:?}", report.actions);
    assert!(restarts[0].ok, "{:?}", restarts[0].error);
    assert_eq!(restarts[0].path, child);
    assert_eq!(report.concurrent_jobs, 1);

    let new_dir: PathBuf = child.join("restart1");
    let cfg = AttemptConfig::load(&new_dir).expect("load").expect("config");
    assert_eq!(cfg.t_start, 12.0);
    let pid = cfg.pid.expect("pid recorded");
    assert!(is_alive(pid));

    let (after, _) = sup.build_tree().expect("tree");
    assert_eq!(after.by_path(&head).map(|n| n.status), Some(Status::Run));
    assert_eq!(after.by_path(&new_dir).map(|n| n.level), Some(3));
    kill(pid).expect("cleanup");
}

#[test]
fn lowest_niceness_attempts_take_the_free_slots() {
    let tmp = tempfile::tempdir().expect("tempdir");
    for (name, niceness) in [("a", 5), ("b", 1), ("c", 3)] {
        write_attempt(
            &tmp.path().join(name),
            &[
                ("Start_command", "true".to_string()),
                ("Niceness", niceness.to_string()),
                ("T_end", "30".to_string()),
            ],
        );
    }

    let report = supervisor(tmp.path(), 2).schedule().expect("pass");
    let started: Vec<PathBuf> = report
        .actions_of(ActionKind::Start)
        .filter(|a| a.ok)
        .map(|a| a.path.clone())
        .collect();
    assert_eq!(started, [tmp.path().join("b"), tmp.path().join("c")]);
    assert_eq!(report.concurrent_jobs, 2);
    assert!(AttemptConfig::load(&tmp.path().join("a"))
        .expect("load")
        .expect("config")
        .timestamp_started
        == 0.0);
}

#[test]
fn running_attempts_hold_slots_and_get_backed_up() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let running = tmp.path().join("a_running");
    let mut fields = vec![
        ("T_end", "30".to_string()),
        ("Restart_file", "restart.txt".to_string()),
        ("Maximum_n_checkpoints", "2".to_string()),
    ];
    started(&mut fields);
    write_attempt(&running, &fields);
    write_output(&running, 4.0);
    fs::write(running.join("restart.txt"), "snapshot").expect("restart file");
    write_pid(&running, std::process::id() as i32);

    write_attempt(
        &tmp.path().join("b_new"),
        &[("Start_command", "true".to_string())],
    );

    let sup = supervisor(tmp.path(), 1);
    let report = sup.schedule().expect("pass");
    assert_eq!(report.concurrent_jobs, 1);
    assert_eq!(report.actions_of(ActionKind::Start).count(), 0);
    let backups: Vec<_> = report.actions_of(ActionKind::Backup).collect();
    assert_eq!(backups.len(), 1);
    assert!(running.join("restart.txt.bak.4.000000").is_file());

    let again = sup.schedule().expect("pass");
    assert_eq!(again.actions_of(ActionKind::Backup).count(), 0);
}

#[test]
fn exhausted_lineage_stays_failed_across_passes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let head = tmp.path().join("sim");
    let mut dir = head.clone();
    for t in [4.0, 3.0, 2.0, 1.0] {
        let mut fields = vec![
            ("T_end", "30".to_string()),
            ("Restart_command", "true".to_string()),
        ];
        started(&mut fields);
        write_attempt(&dir, &fields);
        write_output(&dir, t);
        write_pid(&dir, DEAD_PID);
        dir = dir.join("restart1");
    }

    let reports = supervisor(tmp.path(), 2).run_ticks(2);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].actions_of(ActionKind::Escalate).count(), 1);
    assert!(reports[1].actions.is_empty(), "{:?}", reports[1].actions);
    assert!(head.join("ERROR").is_file());
    assert!(!head.join("restart2").exists());
}
