// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Per-process lifecycle: start, stop, restart, status and log access.

use crate::error::Result;
use crate::logs::{self, LogTail, TailOptions};
use crate::pidfile::{FilePidStore, PidStore};
use crate::process::{self, ProcessExecutor, UnixExecutor};
use crate::readiness::{NetworkProbe, ReadinessProbe, ReadinessStatus};
use crate::registry::ProcessRegistry;
use crate::shutdown::{self, Termination};
use crate::spec::ProcessSpec;
use crate::state::ProcessState;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

impl StartOutcome {
    pub fn pid(self) -> u32 {
        match self {
            Self::Started { pid } | Self::AlreadyRunning { pid } => pid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32, forced: bool },
    /// SIGKILL was not confirmed; the pid file is kept.
    StillRunning { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessStatus>,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(pid) = self.pid else {
            return write!(f, "{}: not running", self.name);
        };
        write!(f, "{}: running (pid {pid})", self.name)?;
        if let Some(address) = &self.address {
            write!(f, " on {address}")?;
        }
        if let Some(readiness) = &self.readiness {
            write!(f, ", {readiness}")?;
        }
        Ok(())
    }
}

pub struct Supervisor {
    registry: ProcessRegistry,
    executor: Arc<dyn ProcessExecutor>,
    probe: Arc<dyn ReadinessProbe>,
}

impl Supervisor {
    pub fn new(
        specs: Vec<ProcessSpec>,
        store: Arc<dyn PidStore>,
        executor: Arc<dyn ProcessExecutor>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<Self> {
        Ok(Self {
            registry: ProcessRegistry::new(specs, store)?,
            executor,
            probe,
        })
    }

    /// Pid files on disk, real processes, network probes.
    pub fn system(specs: Vec<ProcessSpec>) -> Result<Self> {
        Self::new(
            specs,
            Arc::new(FilePidStore),
            Arc::new(UnixExecutor),
            Arc::new(NetworkProbe),
        )
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &dyn ProcessExecutor {
        self.executor.as_ref()
    }

    pub fn specs(&self) -> &[ProcessSpec] {
        self.registry.specs()
    }

    pub async fn start(&self, name: &str) -> Result<StartOutcome> {
        let spec = self.registry.spec(name)?;
        let _lock = self.registry.lock(spec).await?;

        if let Some(pid) = self.registry.refresh(spec, self.executor())? {
            warn!(process = name, pid, "already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        process::validate_launch(spec)?;

        self.registry.transition(name, ProcessState::Starting, None)?;
        let pid = match self.executor.spawn(spec).await {
            Ok(pid) => pid,
            Err(e) => {
                self.registry.transition(name, ProcessState::Stopped, None)?;
                return Err(e);
            }
        };

        if let Err(e) = self.registry.store().write(spec, pid) {
            // Without a pid file nothing could stop it later.
            error!(process = name, pid, "failed to record pid, killing child: {e}");
            if let Err(kill_err) = self.executor.signal(spec, pid, Signal::SIGKILL) {
                error!(process = name, pid, "failed to kill unrecorded child: {kill_err}");
            }
            self.registry.transition(name, ProcessState::Stopped, None)?;
            return Err(e);
        }

        self.registry.transition(name, ProcessState::Running, Some(pid))?;
        info!(process = name, pid, "started");
        Ok(StartOutcome::Started { pid })
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let spec = self.registry.spec(name)?;
        let _lock = self.registry.lock(spec).await?;

        let Some(pid) = self.registry.refresh(spec, self.executor())? else {
            info!(process = name, "not running");
            return Ok(StopOutcome::NotRunning);
        };

        self.registry.transition(name, ProcessState::Stopping, Some(pid))?;
        let termination = match shutdown::terminate(self.executor(), spec, pid).await {
            Ok(t) => t,
            Err(e) => {
                self.registry.transition(name, ProcessState::Running, Some(pid))?;
                return Err(e);
            }
        };

        match termination {
            Termination::Survived => {
                self.registry.transition(name, ProcessState::Running, Some(pid))?;
                Ok(StopOutcome::StillRunning { pid })
            }
            Termination::Graceful | Termination::Forced => {
                self.registry.store().remove(spec)?;
                self.registry.transition(name, ProcessState::Stopped, None)?;
                let forced = termination == Termination::Forced;
                info!(process = name, pid, forced, "stopped");
                Ok(StopOutcome::Stopped { pid, forced })
            }
        }
    }

    /// Stop then start. The result is the start's.
    pub async fn restart(&self, name: &str) -> Result<StartOutcome> {
        match self.stop(name).await? {
            StopOutcome::StillRunning { pid } => {
                warn!(process = name, pid, "previous instance survived SIGKILL");
            }
            StopOutcome::NotRunning | StopOutcome::Stopped { .. } => {}
        }
        self.start(name).await
    }

    pub async fn status(&self, name: &str) -> Result<ProcessStatus> {
        let spec = self.registry.spec(name)?;
        // refresh may remove a stale pid file
        let pid = {
            let _lock = self.registry.lock(spec).await?;
            self.registry.refresh(spec, self.executor())?
        };

        let Some(pid) = pid else {
            return Ok(ProcessStatus {
                name: name.to_string(),
                state: ProcessState::Stopped,
                pid: None,
                address: None,
                readiness: None,
            });
        };

        // Advisory only, never feeds back into the state.
        let readiness = match &spec.readiness {
            Some(check) => Some(self.probe.probe(check).await),
            None => None,
        };
        Ok(ProcessStatus {
            name: name.to_string(),
            state: self.registry.record(name).state,
            pid: Some(pid),
            address: spec.address(),
            readiness,
        })
    }

    pub async fn status_all(&self) -> Result<Vec<ProcessStatus>> {
        let mut statuses = Vec::with_capacity(self.specs().len());
        for spec in self.specs() {
            statuses.push(self.status(&spec.name).await?);
        }
        Ok(statuses)
    }

    /// Probe once; `None` when the process has no readiness check.
    pub async fn probe(&self, name: &str) -> Result<Option<ReadinessStatus>> {
        let spec = self.registry.spec(name)?;
        Ok(match &spec.readiness {
            Some(check) => Some(self.probe.probe(check).await),
            None => None,
        })
    }

    pub fn tail_logs(
        &self,
        name: &str,
        options: TailOptions,
        cancel: CancellationToken,
    ) -> Result<LogTail> {
        let spec = self.registry.spec(name)?;
        Ok(logs::follow(spec.log_path.clone(), options, cancel))
    }
}
