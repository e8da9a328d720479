// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::{Result, SupervisorError};
use crate::spec::{KillMode, ProcessSpec};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Spawns and signals OS processes.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Spawn `spec` detached from the caller and return its pid. The caller
    /// has already validated the launch.
    async fn spawn(&self, spec: &ProcessSpec) -> Result<u32>;

    /// Deliver `sig` according to the spec's kill mode. A process that is
    /// already gone is not an error.
    fn signal(&self, spec: &ProcessSpec, pid: u32, sig: Signal) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Real processes: new session per child, output appended to the log file.
#[derive(Debug, Default)]
pub struct UnixExecutor;

#[async_trait]
impl ProcessExecutor for UnixExecutor {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<u32> {
        let program = resolve_executable(spec)?;
        let log = open_log(spec)?;
        let log_err = log
            .try_clone()
            .map_err(|e| SupervisorError::io(format!("dup {}", spec.log_path.display()), e))?;

        let mut cmd = base_command(spec, &program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            process: spec.name.clone(),
            command: program.display().to_string(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            process: spec.name.clone(),
            command: program.display().to_string(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;

        info!(
            process = %spec.name,
            pid,
            command = %program.display(),
            log = %spec.log_path.display(),
            "spawned detached process"
        );

        // Reap in the background so an exited child never lingers as a zombie
        // while this invocation is still running.
        let name = spec.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(process = %name, pid, %status, "child exited"),
                Err(e) => warn!(process = %name, pid, "failed to reap child: {e}"),
            }
        });

        Ok(pid)
    }

    fn signal(&self, spec: &ProcessSpec, pid: u32, sig: Signal) -> Result<()> {
        send_signal(spec, pid, sig)
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }
}

/// Check everything that would make a spawn pointless before forking.
pub fn validate_launch(spec: &ProcessSpec) -> Result<()> {
    if let Some(dir) = &spec.working_dir
        && !dir.is_dir()
    {
        return Err(SupervisorError::config(
            &spec.name,
            format!("working directory is not a directory: {}", dir.display()),
        ));
    }

    resolve_executable(spec)?;

    for input in &spec.inputs {
        if let Err(e) = File::open(input) {
            return Err(SupervisorError::config(
                &spec.name,
                format!("input not readable: {} ({e})", input.display()),
            ));
        }
    }

    if let Some(dir) = spec.log_path.parent()
        && !dir.as_os_str().is_empty()
        && let Err(e) = fs::create_dir_all(dir)
    {
        return Err(SupervisorError::config(
            &spec.name,
            format!("log directory not creatable: {} ({e})", dir.display()),
        ));
    }

    Ok(())
}

/// Executable path the child will run: slashed commands are taken relative
/// to the working directory, bare names are looked up on `PATH`.
pub fn resolve_executable(spec: &ProcessSpec) -> Result<PathBuf> {
    let command = Path::new(&spec.command);

    let candidate = if spec.command.contains('/') {
        match &spec.working_dir {
            Some(dir) if command.is_relative() => dir.join(command),
            _ => command.to_path_buf(),
        }
    } else {
        let path_var = spec
            .env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(command))
            .find(|p| is_executable(p))
            .ok_or_else(|| {
                SupervisorError::config(
                    &spec.name,
                    format!("executable not found on PATH: {}", spec.command),
                )
            })?
    };

    if !candidate.exists() {
        return Err(SupervisorError::config(
            &spec.name,
            format!("executable not found: {}", candidate.display()),
        ));
    }
    if !is_executable(&candidate) {
        return Err(SupervisorError::config(
            &spec.name,
            format!("not an executable file: {}", candidate.display()),
        ));
    }
    Ok(candidate)
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn open_log(spec: &ProcessSpec) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .map_err(|e| {
            SupervisorError::config(
                &spec.name,
                format!("cannot open log file {}: {e}", spec.log_path.display()),
            )
        })
}

fn base_command(spec: &ProcessSpec, program: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(&spec.args);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Attached child for foreground runs: stdio inherited, same session.
pub fn spawn_foreground(spec: &ProcessSpec) -> Result<Child> {
    let program = resolve_executable(spec)?;
    let mut cmd = base_command(spec, &program);
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        process: spec.name.clone(),
        command: program.display().to_string(),
        source,
    })?;
    info!(
        process = %spec.name,
        pid = ?child.id(),
        command = %program.display(),
        "spawned foreground process"
    );
    Ok(child)
}

fn send_signal(spec: &ProcessSpec, pid: u32, sig: Signal) -> Result<()> {
    let target = Pid::from_raw(raw_pid(spec, pid)?);

    let result = match spec.kill_mode {
        // A child that never became a group leader has no group of its own;
        // fall back to the pid.
        KillMode::ProcessGroup => match signal::killpg(target, sig) {
            Err(Errno::ESRCH) => signal::kill(target, sig),
            other => other,
        },
        KillMode::Process => signal::kill(target, sig),
    };

    match result {
        Ok(()) => {
            debug!(
                process = %spec.name,
                pid,
                signal = %sig,
                kill_mode = %spec.kill_mode,
                "signal sent"
            );
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal {
            process: spec.name.clone(),
            pid,
            signal: sig.to_string(),
            source,
        }),
    }
}

fn raw_pid(spec: &ProcessSpec, pid: u32) -> Result<i32> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| SupervisorError::config(&spec.name, format!("invalid pid {pid}")))
}

/// Signal-0 liveness. EPERM means the pid exists under another user.
/// Zombies count as dead.
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised command name.
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}
