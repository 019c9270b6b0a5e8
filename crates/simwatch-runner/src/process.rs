use crate::attempt::PID_MARKER;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

const PID_MARKER_POLLS: u32 = 20;
const PID_MARKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Zero-signal existence check. EPERM still means the process exists.
#[cfg(unix)]
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: i32) -> bool {
    false
}

/// Sends SIGKILL. A process that is already gone is not an error.
#[cfg(unix)]
pub fn kill(pid: i32) -> Result<()> {
    if pid <= 0 {
        return Err(anyhow!("refusing to signal pid {}", pid));
    }
    if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err).context(format!("failed to send SIGKILL to pid {}", pid));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn kill(_pid: i32) -> Result<()> {
    Err(anyhow!("process killing is only supported on unix"))
}

pub fn read_pid_marker(dir: &Path) -> Option<i32> {
    let text = fs::read_to_string(dir.join(PID_MARKER)).ok()?;
    text.lines()
        .next()
        .and_then(|l| l.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0)
}

/// Launches `command` in the background from `cwd` and returns its pid.
///
/// The wrapper shell records `$!` in the liveness marker and exits at once;
/// only the wrapper is waited for. The marker may appear slightly after the
/// wrapper returns, so it is polled for a bounded time.
pub fn spawn_detached(command: &str, cwd: &Path) -> Result<i32> {
    let marker = cwd.join(PID_MARKER);
    if marker.exists() {
        fs::remove_file(&marker)
            .with_context(|| format!("failed to clear stale {}", marker.display()))?;
    }
    let script = format!("{} & echo $! > {}", command, PID_MARKER);
    let status = Command::new("sh")
        .arg("-c")
        .arg(&script)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("failed to launch `{}` in {}", command, cwd.display()))?;
    if !status.success() {
        return Err(anyhow!(
            "launch wrapper for `{}` exited with {}",
            command,
            status
        ));
    }
    for _ in 0..PID_MARKER_POLLS {
        if let Some(pid) = read_pid_marker(cwd) {
            return Ok(pid);
        }
        thread::sleep(PID_MARKER_POLL_INTERVAL);
    }
    Err(anyhow!(
        "no pid recorded in {} after launching `{}`",
        marker.display(),
        command
    ))
}

/// Runs `command` through the shell without waiting for it. Only the
/// short-lived wrapper is reaped; the command itself is backgrounded.
pub fn spawn_fire_and_forget(command: &str, cwd: &Path) -> Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("{} &", command))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("failed to launch `{}` in {}", command, cwd.display()))?;
    if !status.success() {
        return Err(anyhow!(
            "launch wrapper for `{}` exited with {}",
            command,
            status
        ));
    }
    Ok(())
}
