use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simwatch_runner::actions::{
    kill_attempt, recent_output, request_stop, restart_attempt, start_attempt,
};
use simwatch_runner::logging::{init_logging, LogConfig};
use simwatch_runner::{AttemptId, AttemptRecord, AttemptTree, DaemonConfig, Supervisor, TickReport};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "simwatch", version = "0.3.0", about = "Simulation attempt supervisor")]
struct Cli {
    /// Daemon config file with a [Daemon] section.
    #[arg(long, global = true, default_value = "simwatch.conf")]
    config: PathBuf,
    /// Overrides Root_dir from the config file.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Status {
        #[arg(long)]
        json: bool,
    },
    Once {
        #[arg(long)]
        max_jobs: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    Run {
        #[arg(long)]
        max_jobs: Option<usize>,
        /// Seconds between passes.
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many passes instead of running forever.
        #[arg(long)]
        ticks: Option<usize>,
    },
    Stop {
        #[arg(long)]
        id: AttemptId,
        #[arg(long)]
        json: bool,
    },
    Kill {
        #[arg(long)]
        id: AttemptId,
        #[arg(long)]
        json: bool,
    },
    Backup {
        #[arg(long)]
        id: AttemptId,
        #[arg(long)]
        json: bool,
    },
    Start {
        #[arg(long)]
        id: AttemptId,
        #[arg(long)]
        json: bool,
    },
    Restart {
        #[arg(long)]
        id: AttemptId,
        #[arg(long)]
        json: bool,
    },
    Diagnose {
        #[arg(long)]
        id: AttemptId,
        #[arg(long, default_value_t = 20)]
        lines: usize,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_cli(cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_config(cli: &Cli) -> Result<DaemonConfig> {
    let mut config = if cli.config.is_file() {
        DaemonConfig::load(&cli.config)?
    } else if let Some(root) = &cli.root {
        DaemonConfig::with_root(root)
    } else {
        return Err(anyhow!(
            "config file {} not found; pass --config or --root",
            cli.config.display()
        ));
    };
    if let Some(root) = &cli.root {
        config.root_dir = root.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if !config.root_dir.is_dir() {
        return Err(anyhow!(
            "root directory not found: {}",
            config.root_dir.display()
        ));
    }
    Ok(config)
}

fn run_cli(cli: Cli) -> Result<Option<Value>> {
    let mut config = load_config(&cli)?;
    init_logging(&LogConfig {
        level: config.log_level.clone(),
        json: cli.log_json,
        file: cli.log_file.clone(),
    })?;
    tracing::debug!(config = ?config, "loaded daemon config");

    match cli.command {
        Commands::Status { json } => {
            let supervisor = Supervisor::new(config);
            let (tree, _) = supervisor.build_tree()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "root": tree.root_dir().display().to_string(),
                    "counts": tree.status_counts(),
                    "tree": tree.snapshot()
                })));
            }
            print_tree(&tree);
        }
        Commands::Once { max_jobs, json } => {
            if let Some(n) = max_jobs {
                config.max_concurrent_jobs = n;
            }
            let report = Supervisor::new(config).schedule()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "once",
                    "report": report
                })));
            }
            print_report(&report);
        }
        Commands::Run {
            max_jobs,
            interval,
            ticks,
        } => {
            if let Some(n) = max_jobs {
                config.max_concurrent_jobs = n;
            }
            if let Some(secs) = interval {
                config.poll_interval = Duration::from_secs(secs);
            }
            let supervisor = Supervisor::new(config);
            match ticks {
                Some(n) => supervisor.run_loop(Some(n), print_report),
                None => supervisor.run_forever(),
            }
        }
        Commands::Stop { id, json } => {
            let supervisor = Supervisor::new(config);
            let (tree, _) = supervisor.build_tree()?;
            let node = attempt(&tree, id)?;
            request_stop(node)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stop",
                    "attempt": attempt_to_json(node)
                })));
            }
            println!("stop requested: {}", node.path.display());
        }
        Commands::Kill { id, json } => {
            let supervisor = Supervisor::new(config);
            let (tree, _) = supervisor.build_tree()?;
            let node = attempt(&tree, id)?;
            let killed = kill_attempt(node)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "kill",
                    "attempt": attempt_to_json(node),
                    "killed": killed
                })));
            }
            if killed {
                println!("killed pid {}: {}", node.pid.unwrap_or_default(), node.path.display());
            } else {
                println!("no live process: {}", node.path.display());
            }
        }
        Commands::Backup { id, json } => {
            let supervisor = Supervisor::new(config);
            let (tree, _) = supervisor.build_tree()?;
            let node = attempt(&tree, id)?;
            let outcome = supervisor.checkpoints().backup(node)?;
            let backups = supervisor.checkpoints().list_backups(node)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "backup",
                    "attempt": attempt_to_json(node),
                    "outcome": outcome,
                    "backups": backups.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()
                })));
            }
            println!("backup: {:?}", outcome);
            for path in backups {
                println!("  {}", path.display());
            }
        }
        Commands::Start { id, json } => {
            let supervisor = Supervisor::new(config);
            let (tree, _) = supervisor.build_tree()?;
            let node = attempt(&tree, id)?;
            let pid = start_attempt(node)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "start",
                    "attempt": attempt_to_json(node),
                    "pid": pid
                })));
            }
            println!("started pid {}: {}", pid, node.path.display());
        }
        Commands::Restart { id, json } => {
            let supervisor = Supervisor::new(config);
            let (tree, _) = supervisor.build_tree()?;
            let node = attempt(&tree, id)?;
            let target = tree.restart_target(node.id).unwrap_or(node);
            let dir = restart_attempt(&tree, target.id, supervisor.checkpoints())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "restart",
                    "attempt": attempt_to_json(target),
                    "restart_dir": dir.display().to_string()
                })));
            }
            println!("restarted {} in {}", target.path.display(), dir.display());
        }
        Commands::Diagnose { id, lines, json } => {
            let supervisor = Supervisor::new(config);
            let (tree, _) = supervisor.build_tree()?;
            let node = attempt(&tree, id)?;
            let tails = recent_output(&tree, id, lines)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "diagnose",
                    "attempt": attempt_to_json(node),
                    "restarts_in_lineage": tree
                        .lineage_head(id)
                        .map(|head| tree.lineage_restart_count(head.id)),
                    "output": tails
                })));
            }
            println!("{} [{}] t={} / {}", node.path.display(), node.status, node.t, node.t_max);
            for tail in tails {
                println!("==> {} <==", tail.path.display());
                for line in tail.lines {
                    println!("{}", line);
                }
            }
        }
    }
    Ok(None)
}

fn attempt(tree: &AttemptTree, id: AttemptId) -> Result<&AttemptRecord> {
    tree.get(id)
        .filter(|n| !n.is_root())
        .ok_or_else(|| anyhow!("no attempt with id {} under {}", id, tree.root_dir().display()))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Status { json }
        | Commands::Once { json, .. }
        | Commands::Stop { json, .. }
        | Commands::Kill { json, .. }
        | Commands::Backup { json, .. }
        | Commands::Start { json, .. }
        | Commands::Restart { json, .. }
        | Commands::Diagnose { json, .. } => *json,
        Commands::Run { .. } => false,
    }
}

fn attempt_to_json(node: &AttemptRecord) -> Value {
    json!({
        "id": node.id,
        "name": node.name,
        "path": node.path.display().to_string(),
        "status": node.status,
        "t": node.t,
        "t_max": node.t_max,
        "level": node.level,
        "pid": node.pid
    })
}

fn format_epoch(secs: f64) -> String {
    if secs <= 0.0 {
        return "-".to_string();
    }
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_tree(tree: &AttemptTree) {
    println!("root: {}", tree.root_dir().display());
    println!(
        "{:>4}  {:<32} {:<6} {:>12} {:>12}  {}",
        "id", "name", "status", "t", "t_max", "last output"
    );
    for node in tree.attempts() {
        let indent = "  ".repeat(node.level.saturating_sub(1));
        let marker = if tree.get(node.parent_id.unwrap_or_default()).and_then(|p| p.cid) == Some(node.id)
        {
            "*"
        } else {
            ""
        };
        println!(
            "{:>4}  {:<32} {:<6} {:>12.3} {:>12.3}  {}",
            node.id,
            format!("{}{}{}", indent, node.name, marker),
            node.status.label(),
            node.t,
            node.t_max_extended,
            format_epoch(node.mtime)
        );
    }
    let counts: Vec<String> = tree
        .status_counts()
        .iter()
        .map(|(status, n)| format!("{}={}", status, n))
        .collect();
    println!("attempts: {} ({})", tree.len(), counts.join(", "));
}

fn print_report(report: &TickReport) {
    println!("pass at {}", report.started_at);
    for action in &report.actions {
        let outcome = if action.ok { "ok" } else { "FAILED" };
        let extra = action
            .error
            .as_deref()
            .or(action.detail.as_deref())
            .unwrap_or("");
        println!(
            "  {:<8} #{:<4} {:<6} {} {}",
            format!("{:?}", action.kind).to_lowercase(),
            action.attempt_id,
            outcome,
            action.path.display(),
            extra
        );
    }
    println!(
        "load: {}/{}",
        report.concurrent_jobs, report.max_concurrent_jobs
    );
}
