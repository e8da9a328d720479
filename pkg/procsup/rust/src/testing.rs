// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Test doubles for the executor, readiness and pid store seams.

use crate::error::{Result, SupervisorError};
use crate::pidfile::{PidLock, PidStore};
use crate::process::ProcessExecutor;
use crate::readiness::{ReadinessCheck, ReadinessProbe, ReadinessStatus};
use crate::spec::ProcessSpec;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct FakeState {
    next_pid: u32,
    alive: HashSet<u32>,
    spawned: Vec<(String, u32)>,
    signals: Vec<(u32, Signal, Instant)>,
    ignore_term: HashSet<String>,
    unkillable: HashSet<String>,
    fail_spawn: HashSet<String>,
    fail_signal: HashSet<String>,
    owners: HashMap<u32, String>,
}

/// Records spawns and signals; processes live until signalled.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    state: Mutex<FakeState>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_pid: 10_000,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn ignore_term(&self, name: &str) {
        self.state().ignore_term.insert(name.to_string());
    }

    pub fn unkillable(&self, name: &str) {
        self.state().unkillable.insert(name.to_string());
        self.ignore_term(name);
    }

    pub fn fail_spawn(&self, name: &str) {
        self.state().fail_spawn.insert(name.to_string());
    }

    /// Every signal to this process fails with EPERM.
    pub fn fail_signal(&self, name: &str) {
        self.state().fail_signal.insert(name.to_string());
    }

    /// Make `pid` exist without having been spawned here.
    pub fn adopt(&self, pid: u32) {
        self.state().alive.insert(pid);
    }

    /// Simulate the process dying on its own.
    pub fn kill_externally(&self, pid: u32) {
        self.state().alive.remove(&pid);
    }

    pub fn spawned(&self) -> Vec<(String, u32)> {
        self.state().spawned.clone()
    }

    pub fn spawn_count(&self, name: &str) -> usize {
        self.state().spawned.iter().filter(|(n, _)| n == name).count()
    }

    pub fn signals(&self) -> Vec<(u32, Signal, Instant)> {
        self.state().signals.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state().alive.len()
    }
}

#[async_trait]
impl ProcessExecutor for RecordingExecutor {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<u32> {
        let mut state = self.state();
        if state.fail_spawn.contains(&spec.name) {
            return Err(SupervisorError::Spawn {
                process: spec.name.clone(),
                command: spec.command.clone(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.alive.insert(pid);
        state.spawned.push((spec.name.clone(), pid));
        state.owners.insert(pid, spec.name.clone());
        Ok(pid)
    }

    fn signal(&self, _spec: &ProcessSpec, pid: u32, sig: Signal) -> Result<()> {
        let mut state = self.state();
        state.signals.push((pid, sig, Instant::now()));
        let owner = state.owners.get(&pid).cloned().unwrap_or_default();
        if state.fail_signal.contains(&owner) {
            return Err(SupervisorError::Signal {
                process: owner,
                pid,
                signal: sig.to_string(),
                source: nix::errno::Errno::EPERM,
            });
        }
        let dies = match sig {
            Signal::SIGKILL => !state.unkillable.contains(&owner),
            Signal::SIGTERM | Signal::SIGINT => !state.ignore_term.contains(&owner),
            _ => false,
        };
        if dies {
            state.alive.remove(&pid);
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.state().alive.contains(&pid)
    }
}

/// Readiness answers keyed by probe target.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    ready: Mutex<HashSet<String>>,
}

impl ScriptedProbe {
    pub fn set_ready(&self, target: &str) {
        self.ready.lock().unwrap().insert(target.to_string());
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn probe(&self, check: &ReadinessCheck) -> ReadinessStatus {
        if self.ready.lock().unwrap().contains(&check.target()) {
            ReadinessStatus::Ready
        } else {
            ReadinessStatus::NotReady("connection refused".to_string())
        }
    }
}

/// Pid store whose writes always fail. Remembers the pid it was handed.
#[derive(Debug, Default)]
pub struct FailingPidStore {
    attempted: Mutex<Option<u32>>,
}

impl FailingPidStore {
    pub fn attempted(&self) -> Option<u32> {
        *self.attempted.lock().unwrap()
    }
}

impl PidStore for FailingPidStore {
    fn read(&self, _spec: &ProcessSpec) -> Result<Option<u32>> {
        Ok(None)
    }

    fn write(&self, spec: &ProcessSpec, pid: u32) -> Result<()> {
        *self.attempted.lock().unwrap() = Some(pid);
        Err(SupervisorError::io(
            format!("write {}", spec.pid_file.display()),
            std::io::Error::from(std::io::ErrorKind::StorageFull),
        ))
    }

    fn remove(&self, _spec: &ProcessSpec) -> Result<()> {
        Ok(())
    }

    fn try_lock(&self, _spec: &ProcessSpec) -> Result<Option<PidLock>> {
        Ok(Some(PidLock::unlocked()))
    }
}
