// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Local process supervisor: owns the lifecycle of a named set of
//! long-running child processes through pid files and OS signals.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod logs;
pub mod orchestrator;
pub mod pidfile;
pub mod process;
pub mod readiness;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod spec;
pub mod state;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SupervisorError};
pub use spec::ProcessSpec;
pub use state::ProcessState;
pub use supervisor::{ProcessStatus, StartOutcome, StopOutcome, Supervisor};
