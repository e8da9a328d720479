// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Scratch config, run and log directories for one test.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        std::fs::create_dir(dir.path().join("procsup.d")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_dir(&self) -> PathBuf {
        self.path().join("procsup.d")
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.path().join("run").join(format!("{name}.pid"))
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.path().join("logs").join(format!("{name}.log"))
    }

    /// Write `<config_dir>/<name>.yaml`.
    pub fn write_config(&self, name: &str, yaml: &str) {
        let path = self.config_dir().join(format!("{name}.yaml"));
        std::fs::write(&path, yaml)
            .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    }

    /// Pid recorded in the process's pid file.
    pub fn pid(&self, name: &str) -> Option<u32> {
        std::fs::read_to_string(self.pid_file(name))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_dd-procsup"));
        cmd.args(args)
            .env("DD_PROCSUP_CONFIG_DIR", self.config_dir())
            .env("DD_PROCSUP_RUN_DIR", self.path().join("run"))
            .env("DD_PROCSUP_LOG_DIR", self.path().join("logs"))
            .env("DD_PROCSUP_LOG_LEVEL", "debug")
            .env_remove("DD_PROCSUP_STOP_TIMEOUT")
            .current_dir(self.path());
        cmd
    }

    /// Run the CLI to completion.
    pub fn run(&self, args: &[&str]) -> CliOutput {
        self.run_with_env(args, &[])
    }

    /// Run the CLI to completion with extra environment variables.
    pub fn run_with_env(&self, args: &[&str], vars: &[(&str, &str)]) -> CliOutput {
        let output = self
            .command(args)
            .envs(vars.iter().copied())
            .stdin(Stdio::null())
            .output()
            .expect("failed to run dd-procsup");
        let out = CliOutput::from(output);
        eprintln!("[dd-procsup {}] exit={:?}", args.join(" "), out.code);
        eprintln!("{}", out.stderr);
        out
    }

    /// Run the CLI in the background with output captured line by line.
    pub fn spawn(&self, args: &[&str]) -> CliHandle {
        let child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start dd-procsup");
        CliHandle::new(child)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Leave no supervised process behind, whatever the test did.
        let Ok(entries) = std::fs::read_dir(self.path().join("run")) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "pid")
                && let Some(pid) = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<i32>().ok())
            {
                let _ = signal::killpg(Pid::from_raw(pid), Signal::SIGKILL);
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

pub struct CliOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Pid from a `<name>: started (pid N)` or `already running (pid N)` line.
    pub fn reported_pid(&self) -> Option<u32> {
        let marker = "(pid ";
        let start = self.stdout.find(marker)? + marker.len();
        let end = self.stdout[start..].find(|c: char| !c.is_ascii_digit())? + start;
        self.stdout[start..end].parse().ok()
    }
}

impl From<Output> for CliOutput {
    fn from(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// A long-running CLI invocation (`logs`, `dev`).
pub struct CliHandle {
    child: Child,
    stdout_lines: Arc<Mutex<Vec<String>>>,
    _stdout_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

impl CliHandle {
    fn new(mut child: Child) -> Self {
        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let stdout_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&stdout_lines);

        let stdout_thread = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(l) => {
                        eprintln!("[cli] {l}");
                        lines_clone.lock().unwrap().push(l);
                    }
                    Err(_) => break,
                }
            }
        });
        // tracing output goes to stderr; forward it for debugging only.
        let stderr_thread = std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(l) => eprintln!("[cli:err] {l}"),
                    Err(_) => break,
                }
            }
        });

        Self {
            child,
            stdout_lines,
            _stdout_thread: stdout_thread,
            _stderr_thread: stderr_thread,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn lines(&self) -> Vec<String> {
        self.stdout_lines.lock().unwrap().clone()
    }

    /// Wait until a stdout line containing `pattern` appears, or timeout.
    pub fn wait_for_line(&self, pattern: &str, timeout: Duration) -> bool {
        wait_until(timeout, || self.lines().iter().any(|l| l.contains(pattern)))
    }

    pub fn send_signal(&self, sig: Signal) {
        signal::kill(Pid::from_raw(self.child.id() as i32), sig)
            .expect("failed to signal dd-procsup");
    }

    /// Wait for exit, killing the CLI if it overruns `timeout`.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait().expect("failed to check dd-procsup") {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed dd-procsup");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for CliHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Poll `condition` every 50ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Liveness as the supervisor sees it: zombies are dead.
pub fn pid_is_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .is_none_or(|state| state != "Z"),
        Err(_) => true,
    }
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    wait_until(timeout, || !pid_is_alive(pid))
}

/// A pid that existed moments ago and is now gone.
pub fn dead_pid() -> u32 {
    let mut child = Command::new("/bin/true").spawn().expect("spawn /bin/true");
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Config for a process that runs until stopped.
pub fn sleeper_config() -> &'static str {
    "command: /bin/sleep\nargs:\n  - '300'\n"
}
