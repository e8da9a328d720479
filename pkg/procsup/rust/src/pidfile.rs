// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Durable pid records and the per-process lifecycle lock.

use crate::error::{Result, SupervisorError};
use crate::spec::ProcessSpec;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Held for the duration of one lifecycle operation; released on drop.
#[derive(Debug)]
pub struct PidLock {
    _flock: Option<Flock<File>>,
}

impl PidLock {
    pub(crate) fn unlocked() -> Self {
        Self { _flock: None }
    }
}

pub trait PidStore: Send + Sync {
    /// Pid recorded for the process, if any. Unparsable files are discarded.
    fn read(&self, spec: &ProcessSpec) -> Result<Option<u32>>;

    fn write(&self, spec: &ProcessSpec, pid: u32) -> Result<()>;

    /// Removing an absent record is not an error.
    fn remove(&self, spec: &ProcessSpec) -> Result<()>;

    /// `Ok(None)` when another holder has the lock.
    fn try_lock(&self, spec: &ProcessSpec) -> Result<Option<PidLock>>;
}

/// Pid files on disk, next to a `.lock` file taken with `flock(2)`.
#[derive(Debug, Default)]
pub struct FilePidStore;

impl FilePidStore {
    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .map_err(|e| SupervisorError::io(format!("create {}", dir.display()), e))?;
        }
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".tmp.{}", std::process::id()));
        PathBuf::from(name)
    }
}

impl PidStore for FilePidStore {
    fn read(&self, spec: &ProcessSpec) -> Result<Option<u32>> {
        let path = &spec.pid_file;
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SupervisorError::io(format!("read {}", path.display()), e)),
        };

        match parse_pid(&contents) {
            Some(pid) => Ok(Some(pid)),
            None => {
                warn!(
                    process = %spec.name,
                    pidfile = %path.display(),
                    "discarding unparsable pid file"
                );
                self.remove(spec)?;
                Ok(None)
            }
        }
    }

    fn write(&self, spec: &ProcessSpec, pid: u32) -> Result<()> {
        let path = &spec.pid_file;
        Self::ensure_parent(path)?;

        // Readers never observe a half-written pid.
        let tmp = Self::temp_path(path);
        let write_tmp = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            writeln!(file, "{pid}")?;
            file.sync_all()
        };
        if let Err(e) = write_tmp() {
            let _ = fs::remove_file(&tmp);
            return Err(SupervisorError::io(format!("write {}", tmp.display()), e));
        }
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            SupervisorError::io(format!("rename to {}", path.display()), e)
        })?;

        debug!(process = %spec.name, pidfile = %path.display(), pid, "wrote pid file");
        Ok(())
    }

    fn remove(&self, spec: &ProcessSpec) -> Result<()> {
        match fs::remove_file(&spec.pid_file) {
            Ok(()) => {
                debug!(
                    process = %spec.name,
                    pidfile = %spec.pid_file.display(),
                    "removed pid file"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::io(
                format!("remove {}", spec.pid_file.display()),
                e,
            )),
        }
    }

    fn try_lock(&self, spec: &ProcessSpec) -> Result<Option<PidLock>> {
        let path = spec.lock_path();
        Self::ensure_parent(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| SupervisorError::io(format!("open {}", path.display()), e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(PidLock {
                _flock: Some(flock),
            })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(SupervisorError::io(
                format!("lock {}", path.display()),
                errno.into(),
            )),
        }
    }
}

/// Pid records kept in memory. Locking always succeeds.
#[derive(Debug, Default)]
pub struct InMemoryPidStore {
    pids: Mutex<HashMap<String, u32>>,
}

impl InMemoryPidStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pids(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        // A poisoned map is still consistent: every update is a single insert or remove.
        self.pids.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PidStore for InMemoryPidStore {
    fn read(&self, spec: &ProcessSpec) -> Result<Option<u32>> {
        Ok(self.pids().get(&spec.name).copied())
    }

    fn write(&self, spec: &ProcessSpec, pid: u32) -> Result<()> {
        self.pids().insert(spec.name.clone(), pid);
        Ok(())
    }

    fn remove(&self, spec: &ProcessSpec) -> Result<()> {
        self.pids().remove(&spec.name);
        Ok(())
    }

    fn try_lock(&self, _spec: &ProcessSpec) -> Result<Option<PidLock>> {
        Ok(Some(PidLock::unlocked()))
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0 && i32::try_from(*pid).is_ok())
}
