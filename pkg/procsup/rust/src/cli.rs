// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::Settings;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dd-procsup", version)]
#[command(about = "Start, stop and inspect a set of local long-running processes")]
pub struct Cli {
    /// Directory of per-process YAML definitions [env: DD_PROCSUP_CONFIG_DIR]
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Default directory for pid files [env: DD_PROCSUP_RUN_DIR]
    #[arg(long, global = true)]
    pub run_dir: Option<PathBuf>,

    /// Default directory for process logs [env: DD_PROCSUP_LOG_DIR]
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start a process in the background
    Start { name: String },
    /// Stop a process, escalating to SIGKILL after its stop timeout
    Stop { name: String },
    /// Stop then start a process
    Restart { name: String },
    /// Show whether processes are running and ready
    Status {
        /// Only this process
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print a process log, then follow it
    Logs {
        name: String,
        /// Existing lines to show first
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
        /// Exit after printing existing lines
        #[arg(long)]
        no_follow: bool,
    },
    /// Start processes in dependency order, all of them by default
    Up { names: Vec<String> },
    /// Stop processes in reverse dependency order, all of them by default
    Down { names: Vec<String> },
    /// Run a process in the foreground with its dev variant
    Dev { name: String },
    /// List registered processes and their resolved paths
    List,
}

impl Cli {
    /// Command-line directories take precedence over the environment.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(dir) = &self.config_dir {
            settings.config_dir = dir.clone();
        }
        if let Some(dir) = &self.run_dir {
            settings.run_dir = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            settings.log_dir = dir.clone();
        }
    }
}
