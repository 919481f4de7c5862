//! Shared command execution protocol for both CEL variants.
//!
//! Spawns the child with piped stdio inside the mount root, attaches the
//! resource tracer, samples it while polling for exit, and enforces the
//! wall-clock timeout. Spawn failures and timeouts surface as
//! `exit_code = -1` with the cause in stderr; they never fail the CEL.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::tracer::ProcessTracer;
use crate::ExecRequest;
use ccw_common::ResourceUsage;

/// Raw outcome of one spawn, before the variant attaches `touched`.
pub struct RawExec {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub usage: ResourceUsage,
}

impl RawExec {
    fn failed(message: String) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message,
            usage: ResourceUsage::default(),
        }
    }
}

/// Resolve the request cwd against the mount root and create it on demand.
///
/// Absolute paths are re-rooted by stripping their filesystem anchor, so a
/// caller can never escape the mount.
pub fn resolve_cwd(mount: &Path, cwd: Option<&Path>) -> Result<PathBuf> {
    let resolved = match cwd {
        None => mount.to_path_buf(),
        Some(dir) if dir.is_absolute() => {
            let stripped: PathBuf = dir
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect();
            mount.join(stripped)
        }
        Some(dir) => mount.join(dir),
    };
    std::fs::create_dir_all(&resolved)
        .map_err(|e| anyhow!("Failed to create working directory {}: {e}", resolved.display()))?;
    Ok(resolved)
}

/// Run one command inside the mount root.
pub fn run_command(mount: &Path, req: &ExecRequest) -> RawExec {
    let Some(program) = req.cmd.first() else {
        return RawExec::failed("empty command".to_string());
    };

    let cwd = match resolve_cwd(mount, req.cwd.as_deref()) {
        Ok(cwd) => cwd,
        Err(e) => return RawExec::failed(e.to_string()),
    };

    // Host environment first, caller overlay second: callee keys win.
    let mut exec_env: HashMap<String, String> = std::env::vars().collect();
    exec_env.extend(req.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut command = Command::new(program);
    command
        .args(&req.cmd[1..])
        .current_dir(&cwd)
        .env_clear()
        .envs(&exec_env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if req.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return RawExec::failed(format!("Failed to spawn {program}: {e}")),
    };

    let mut tracer = ProcessTracer::new();
    tracer.attach(child.id());

    let stdin_handle = req.stdin.clone().and_then(|input| {
        child.stdin.take().map(|mut pipe| {
            thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            })
        })
    });

    let stdout_handle = child.stdout.take().map(spawn_reader);
    let stderr_handle = child.stderr.take().map(spawn_reader);

    let timeout = Duration::from_millis(req.timeout_ms);
    let started = Instant::now();
    let mut timed_out = false;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "wait on child failed");
                break None;
            }
        }
        if started.elapsed() >= timeout {
            timed_out = true;
            let _ = child.kill();
            break child.wait().ok();
        }
        tracer.sample();
        thread::sleep(tracer.sample_interval());
    };

    let usage = tracer.usage();

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    let stdout = join_reader(stdout_handle);
    let mut stderr = join_reader(stderr_handle);

    let exit_code = if timed_out {
        if stderr.is_empty() {
            stderr = format!("command timed out after {} ms", req.timeout_ms);
        }
        -1
    } else {
        // Exit on signal has no code; report -1 like a timeout.
        status.and_then(|s| s.code()).unwrap_or(-1)
    };

    RawExec {
        exit_code,
        stdout,
        stderr,
        usage,
    }
}

fn spawn_reader<R>(mut reader: R) -> thread::JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        buf
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    match handle.map(|h| h.join()) {
        Some(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        _ => String::new(),
    }
}
