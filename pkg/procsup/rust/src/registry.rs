// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Registered process specs and their runtime records.
//!
//! The pid store is the source of truth. Records are a cache that is
//! revalidated against OS liveness before every lifecycle operation.

use crate::error::{Result, SupervisorError};
use crate::pidfile::{PidLock, PidStore};
use crate::process::ProcessExecutor;
use crate::retry::poll_until;
use crate::spec::ProcessSpec;
use crate::state::ProcessState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on waiting for a concurrent invocation to finish.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessRecord {
    pub pid: Option<u32>,
    pub state: ProcessState,
}

pub struct ProcessRegistry {
    specs: Vec<ProcessSpec>,
    store: Arc<dyn PidStore>,
    records: Mutex<HashMap<String, ProcessRecord>>,
    lock_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new(specs: Vec<ProcessSpec>, store: Arc<dyn PidStore>) -> Result<Self> {
        let mut seen = HashMap::new();
        for spec in &specs {
            if seen.insert(spec.name.as_str(), ()).is_some() {
                return Err(SupervisorError::config(&spec.name, "defined more than once"));
            }
        }
        Ok(Self {
            specs,
            store,
            records: Mutex::new(HashMap::new()),
            lock_timeout: LOCK_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Specs in configuration order.
    pub fn specs(&self) -> &[ProcessSpec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> Result<&ProcessSpec> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))
    }

    pub fn store(&self) -> &dyn PidStore {
        self.store.as_ref()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached record. Unknown names read as `Stopped`.
    pub fn record(&self, name: &str) -> ProcessRecord {
        self.records().get(name).copied().unwrap_or_default()
    }

    /// Move `name` to `to`. Staying in the same state only updates the pid.
    pub fn transition(&self, name: &str, to: ProcessState, pid: Option<u32>) -> Result<()> {
        let mut records = self.records();
        let record = records.entry(name.to_string()).or_default();
        let from = record.state;
        if from != to && !from.can_transition_to(to) {
            return Err(SupervisorError::InvalidTransition {
                process: name.to_string(),
                from,
                to,
            });
        }
        if from != to {
            debug!(process = name, %from, %to, "state transition");
        }
        *record = ProcessRecord { pid, state: to };
        Ok(())
    }

    /// Take the per-process lifecycle lock, retrying while another
    /// invocation holds it.
    pub async fn lock(&self, spec: &ProcessSpec) -> Result<PidLock> {
        let mut acquired: Option<Result<PidLock>> = None;
        let outcome = poll_until(LOCK_RETRY_INTERVAL, self.lock_timeout, || {
            let done = match self.store.try_lock(spec) {
                Ok(Some(lock)) => {
                    acquired = Some(Ok(lock));
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    acquired = Some(Err(e));
                    true
                }
            };
            std::future::ready(done)
        })
        .await;

        match acquired {
            Some(result) => result,
            None => {
                debug_assert!(!outcome.is_satisfied());
                Err(SupervisorError::Busy {
                    process: spec.name.clone(),
                    lock: spec.lock_path(),
                })
            }
        }
    }

    /// Revalidate the record against the pid store and OS liveness.
    /// Returns the live pid, removing the pid file when it is stale.
    pub fn refresh(
        &self,
        spec: &ProcessSpec,
        executor: &dyn ProcessExecutor,
    ) -> Result<Option<u32>> {
        let Some(pid) = self.store.read(spec)? else {
            if self.record(&spec.name).state == ProcessState::Running {
                self.transition(&spec.name, ProcessState::Stopped, None)?;
            }
            return Ok(None);
        };

        if executor.is_alive(pid) {
            let record = self.record(&spec.name);
            if record.state != ProcessState::Running || record.pid != Some(pid) {
                info!(process = %spec.name, pid, "found running process");
            }
            self.transition(&spec.name, ProcessState::Running, Some(pid))?;
            return Ok(Some(pid));
        }

        warn!(
            process = %spec.name,
            pid,
            pidfile = %spec.pid_file.display(),
            "removing stale pid file"
        );
        self.store.remove(spec)?;
        self.force_stopped(&spec.name);
        Ok(None)
    }

    /// Reset a record whose process is gone, from whatever state it was in.
    pub(crate) fn force_stopped(&self, name: &str) {
        self.records()
            .insert(name.to_string(), ProcessRecord::default());
    }
}
