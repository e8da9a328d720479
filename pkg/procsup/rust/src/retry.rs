// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Bounded polling shared by stop escalation, lock acquisition and
//! readiness waits.

use std::future::Future;
use tokio::time::{Duration, Instant};

/// Liveness poll period used while waiting for a process to exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The probe returned true before the deadline.
    Satisfied { attempts: u32 },
    /// The deadline passed. `attempts` includes the final check at the deadline.
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_satisfied(self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }
}

/// Run `probe` every `interval` until it returns true or `max` has elapsed.
///
/// The probe runs once immediately and once more exactly at the deadline.
/// Sleeps are clamped to the remaining time, so the call returns no later
/// than `max` plus the cost of the last probe.
pub async fn poll_until<F, Fut>(interval: Duration, max: Duration, mut probe: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + max;
    let mut attempts = 0;

    loop {
        attempts += 1;
        if probe().await {
            return PollOutcome::Satisfied { attempts };
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut { attempts };
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
