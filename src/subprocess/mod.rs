//! Subprocess runner (C7).
//!
//! Spawns a child in its own process group so the whole tree can be
//! signalled, tees combined stdout/stderr to a log file while keeping a
//! ring of the last 50 lines, and escalates from a graceful terminate to
//! a hard kill on timeout.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::ProcessError;

const LAST_LINES_CAP: usize = 50;
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub duration_sec: f64,
    pub timed_out: bool,
    pub log_path: PathBuf,
    pub last_lines: Vec<String>,
}

pub async fn spawn_process(
    argv: &[String],
    log_path: &Path,
    env: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<ProcessResult, ProcessError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcessError::Spawn("empty argv".to_string()));
    };

    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ProcessError::Spawn(e.to_string()))?;
        }
    }
    let log_file = std::fs::File::create(log_path).map_err(|e| ProcessError::Spawn(e.to_string()))?;
    let log_file = std::sync::Arc::new(Mutex::new(log_file));

    let mut cmd = Command::new(program);
    cmd.args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    new_process_group(&mut cmd);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn(e.to_string()))?;
    let pid = child.id();

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let last_lines = std::sync::Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(LAST_LINES_CAP)));

    let reader_handle = tokio::spawn(read_combined(stdout, stderr, log_file, last_lines.clone()));

    let wait_result = match timeout {
        Some(d) => match tokio::time::timeout(d, child.wait()).await {
            Ok(status) => (status, false),
            Err(_) => (terminate_then_kill(&mut child, pid).await, true),
        },
        None => (child.wait().await, false),
    };
    let (exit_status, timed_out) = wait_result;

    // The reader finishes once both pipes hit EOF, which happens once the
    // child (or its whole process group) has actually exited.
    let _ = reader_handle.await;

    let exit_code = exit_status.ok().and_then(|s| s.code());
    let duration_sec = start.elapsed().as_secs_f64();
    let snapshot: Vec<String> = last_lines.lock().unwrap().iter().cloned().collect();

    Ok(ProcessResult {
        exit_code,
        duration_sec,
        timed_out,
        log_path: log_path.to_path_buf(),
        last_lines: snapshot,
    })
}

async fn read_combined(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    log_file: std::sync::Arc<Mutex<std::fs::File>>,
    last_lines: std::sync::Arc<std::sync::Mutex<VecDeque<String>>>,
) {
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;

    while !out_done || !err_done {
        tokio::select! {
            line = out_lines.next_line(), if !out_done => {
                match line {
                    Ok(Some(l)) => record_line(&log_file, &last_lines, l).await,
                    _ => out_done = true,
                }
            }
            line = err_lines.next_line(), if !err_done => {
                match line {
                    Ok(Some(l)) => record_line(&log_file, &last_lines, l).await,
                    _ => err_done = true,
                }
            }
        }
    }
}

async fn record_line(
    log_file: &Mutex<std::fs::File>,
    last_lines: &std::sync::Arc<std::sync::Mutex<VecDeque<String>>>,
    line: String,
) {
    use std::io::Write;
    {
        let mut f = log_file.lock().await;
        let _ = writeln!(f, "{line}");
    }
    let mut lines = last_lines.lock().unwrap();
    if lines.len() >= LAST_LINES_CAP {
        lines.pop_front();
    }
    lines.push_back(line);
}

/// Sends SIGTERM, then races the child's exit against `KILL_GRACE` instead
/// of sleeping the full grace period — a child that dies immediately on
/// SIGTERM should not make the caller wait 10s regardless.
async fn terminate_then_kill(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
) -> std::io::Result<std::process::ExitStatus> {
    let Some(pid) = pid else { return child.wait().await };
    send_terminate(pid);
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            send_kill(pid);
            child.wait().await
        }
    }
}

#[cfg(unix)]
unsafe extern "C" {
    fn setsid() -> i32;
    fn killpg(pgrp: i32, sig: i32) -> i32;
}

#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid() is async-signal-safe and pre_exec guarantees we're
    // called post-fork, pre-exec, single-threaded in the child.
    unsafe {
        cmd.pre_exec(|| {
            setsid();
            Ok(())
        });
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    // SAFETY: killpg with a valid process group id is always safe to call.
    unsafe {
        killpg(pid as i32, 15 /* SIGTERM */);
    }
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    // SAFETY: killpg with a valid process group id is always safe to call.
    unsafe {
        killpg(pid as i32, 9 /* SIGKILL */);
    }
}

#[cfg(windows)]
fn new_process_group(cmd: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(windows)]
fn send_terminate(_pid: u32) {
    // CTRL_BREAK delivery requires GenerateConsoleCtrlEvent via winapi, out of
    // scope for this port; fall straight through to kill on Windows.
}

#[cfg(windows)]
fn send_kill(_pid: u32) {}
