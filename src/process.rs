//! Agent process supervision.
//!
//! Spawns one short-lived agent CLI per invocation in its **own process
//! group**, so that timeout and shutdown signalling reaches the whole
//! subtree, not just the direct child. Stdout and stderr are captured in
//! full (agents produce kilobyte-to-megabyte outputs; no streaming
//! back-pressure is needed).
//!
//! Escalation policy: SIGTERM to the group, a fixed 5-second grace window,
//! then SIGKILL to the group. If group signalling fails (the process is
//! already gone), fall back to killing the child directly and ignore the
//! error.

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace window between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting out the grace window during a global drain.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Everything needed to spawn one agent child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Outcome of one supervised child. Produced exactly once per spawn; spawn
/// failures are reported here (exit code 1, error text in stderr) rather
/// than as `Err`.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// None when the child was ended by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    /// Name of the terminating signal, when there was one.
    pub signal: Option<String>,
    pub duration: Duration,
}

impl ProcessOutput {
    fn spawn_failure(error: String, duration: Duration) -> Self {
        Self {
            exit_code: Some(1),
            timed_out: false,
            stdout: String::new(),
            stderr: error,
            signal: None,
            duration,
        }
    }

    pub fn clean_exit(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Tracks every live child process group for global shutdown.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    tracked: Mutex<HashMap<u64, i32>>,
    next_id: AtomicU64,
}

fn signal_group(pgid: i32, signal: Signal) -> nix::Result<()> {
    // Negative pid addresses the whole process group.
    nix::sys::signal::kill(Pid::from_raw(-pgid), signal)
}

fn group_alive(pgid: i32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(-pgid), None).is_ok()
}

fn signal_name(raw: i32) -> Option<String> {
    Signal::try_from(raw).ok().map(|s| s.as_str().to_string())
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live tracked children.
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawn and supervise one child to completion.
    ///
    /// The child runs in a fresh process group. Cancellation of `cancel`
    /// applies the same SIGTERM-grace-SIGKILL escalation as a timeout.
    pub async fn spawn(&self, spec: SpawnSpec, cancel: &CancellationToken) -> ProcessOutput {
        let start = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutput::spawn_failure(
                    format!("Failed to spawn {}: {}", spec.program, e),
                    start.elapsed(),
                );
            }
        };

        // With process_group(0) the child leads its own group: pgid == pid.
        let pgid = child.id().map(|pid| pid as i32);
        let track_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(pgid) = pgid {
            self.tracked
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(track_id, pgid);
        }
        debug!(program = %spec.program, pid = ?pgid, "spawned agent child");

        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_task = tokio::spawn(read_all(stdout_handle));
        let stderr_task = tokio::spawn(read_all(stderr_handle));

        let mut timed_out = false;
        let wait_result = tokio::select! {
            status = child.wait() => status,
            _ = wait_deadline(spec.timeout) => {
                timed_out = true;
                warn!(program = %spec.program, timeout = ?spec.timeout, "agent timed out, escalating");
                escalate(&mut child, pgid).await
            }
            _ = cancel.cancelled() => {
                debug!(program = %spec.program, "cancellation observed, escalating");
                escalate(&mut child, pgid).await
            }
        };

        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&track_id);

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        match wait_result {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                ProcessOutput {
                    exit_code: status.code(),
                    timed_out,
                    stdout,
                    stderr,
                    signal: status.signal().and_then(signal_name),
                    duration: start.elapsed(),
                }
            }
            Err(e) => ProcessOutput {
                exit_code: Some(1),
                timed_out,
                stdout,
                stderr: format!("{stderr}\nwait failed: {e}"),
                signal: None,
                duration: start.elapsed(),
            },
        }
    }

    /// Terminate every tracked child group: SIGTERM each, wait out the
    /// grace window, SIGKILL survivors. Called from the shutdown path.
    pub async fn kill_all_tracked(&self) {
        let groups: Vec<i32> = {
            let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            tracked.drain().map(|(_, pgid)| pgid).collect()
        };
        if groups.is_empty() {
            return;
        }

        debug!(count = groups.len(), "terminating tracked process groups");
        for &pgid in &groups {
            if signal_group(pgid, Signal::SIGTERM).is_err() {
                debug!(pgid, "process group already gone");
            }
        }

        let deadline = Instant::now() + TERM_GRACE;
        loop {
            if !groups.iter().any(|&pgid| group_alive(pgid)) {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        for &pgid in &groups {
            if group_alive(pgid) {
                warn!(pgid, "group survived SIGTERM grace, sending SIGKILL");
                let _ = signal_group(pgid, Signal::SIGKILL);
            }
        }
    }
}

async fn wait_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM the group, wait out the grace window, SIGKILL if the leader is
/// still alive. Falls back to killing the child directly when group
/// signalling fails.
async fn escalate(child: &mut Child, pgid: Option<i32>) -> std::io::Result<std::process::ExitStatus> {
    match pgid {
        Some(pgid) if signal_group(pgid, Signal::SIGTERM).is_ok() => {}
        _ => {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            match pgid {
                Some(pgid) if signal_group(pgid, Signal::SIGKILL).is_ok() => {}
                _ => {
                    let _ = child.start_kill();
                }
            }
            child.wait().await
        }
    }
}

async fn read_all(handle: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut buf = Vec::new();
    if let Some(mut handle) = handle {
        let _ = handle.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
