// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Supervisor errors.
//!
//! Only real failures live here. "Already running", "not running" and forced
//! kills are reported through the outcome types of the supervisor instead.

use crate::state::ProcessState;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown process '{0}'")]
    UnknownProcess(String),

    #[error("[{process}] configuration error: {reason}")]
    Configuration { process: String, reason: String },

    #[error("[{process}] failed to spawn {command}: {source}")]
    Spawn {
        process: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("[{process}] invalid state transition from {from} to {to}")]
    InvalidTransition {
        process: String,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("[{process}] another invocation holds {}", .lock.display())]
    Busy { process: String, lock: PathBuf },

    #[error("[{process}] failed to send {signal} to pid {pid}: {source}")]
    Signal {
        process: String,
        pid: u32,
        signal: String,
        #[source]
        source: nix::Error,
    },

    #[error("[{process}] not ready after {:.1}s: {last}", .waited.as_secs_f64())]
    ReadinessTimeout {
        process: String,
        waited: std::time::Duration,
        last: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn config(process: impl Into<String>, reason: impl Into<String>) -> Self {
        SupervisorError::Configuration {
            process: process.into(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SupervisorError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors caused by the process definition rather than the OS.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SupervisorError::Configuration { .. } | SupervisorError::UnknownProcess(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
