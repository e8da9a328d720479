// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::Result;
use crate::process::ProcessExecutor;
use crate::retry::{POLL_INTERVAL, poll_until};
use crate::spec::ProcessSpec;
use nix::sys::signal::Signal;
use std::future::ready;
use tokio::time::Duration;
use tracing::{info, warn};

/// How long to wait for SIGKILL to take effect.
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period.
    Graceful,
    /// Needed SIGKILL.
    Forced,
    /// Still alive after SIGKILL.
    Survived,
}

/// SIGTERM, wait up to the spec's `stop_timeout`, then SIGKILL.
pub async fn terminate(
    executor: &dyn ProcessExecutor,
    spec: &ProcessSpec,
    pid: u32,
) -> Result<Termination> {
    info!(process = %spec.name, pid, signal = "SIGTERM", "stopping");
    executor.signal(spec, pid, Signal::SIGTERM)?;

    let exited = poll_until(POLL_INTERVAL, spec.stop_timeout, || {
        ready(!executor.is_alive(pid))
    })
    .await;
    if exited.is_satisfied() {
        return Ok(Termination::Graceful);
    }

    warn!(
        process = %spec.name,
        pid,
        signal = "SIGKILL",
        "stop timeout ({:.1}s) reached, escalating",
        spec.stop_timeout.as_secs_f64()
    );
    executor.signal(spec, pid, Signal::SIGKILL)?;

    let killed = poll_until(POLL_INTERVAL, KILL_CONFIRM_TIMEOUT, || {
        ready(!executor.is_alive(pid))
    })
    .await;
    if killed.is_satisfied() {
        Ok(Termination::Forced)
    } else {
        warn!(process = %spec.name, pid, "still running after SIGKILL, giving up");
        Ok(Termination::Survived)
    }
}
