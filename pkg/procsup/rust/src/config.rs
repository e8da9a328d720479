// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::spec::KillMode;

const DEFAULT_CONFIG_DIR: &str = "procsup.d";
const DEFAULT_RUN_DIR: &str = "run";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix shared by every environment variable the supervisor reads.
pub const ENV_PREFIX: &str = "DD_PROCSUP";

fn default_http_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

/// One process definition, as written in `<config_dir>/<name>.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    /// Files the child needs to read (model weights, config). Checked before spawning.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub readiness: Option<ReadinessConfig>,
    /// Seconds between SIGTERM and SIGKILL.
    pub stop_timeout: Option<f64>,
    #[serde(default)]
    pub kill_mode: KillMode,
    #[serde(default)]
    pub after: Vec<String>,
    /// Seconds `up` waits for readiness before starting dependents.
    pub ready_timeout: Option<f64>,
    pub dev: Option<DevConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReadinessConfig {
    Tcp {
        #[serde(default)]
        timeout: Option<f64>,
    },
    Http {
        /// Full URL. When absent it is built from `host`, `port` and `path`.
        #[serde(default)]
        url: Option<String>,
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
        #[serde(default)]
        timeout: Option<f64>,
    },
}

/// Foreground variant used by `dev`, typically the same server with auto-reload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProcessConfig {
    /// Apply `DD_PROCSUP_<NAME>_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides<F>(&mut self, name: &str, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&process_env_key(name, suffix));

        if let Some(command) = get("COMMAND") {
            debug!(process = name, %command, "command overridden from environment");
            self.command = command;
        }
        if let Some(input) = get("INPUT") {
            self.inputs = vec![PathBuf::from(input)];
        }
        if let Some(host) = get("HOST") {
            self.host = Some(host);
        }
        if let Some(port) = get("PORT") {
            let port = port.parse().with_context(|| {
                format!("{}: invalid port '{port}'", process_env_key(name, "PORT"))
            })?;
            self.port = Some(port);
        }
        if let Some(timeout) = get("STOP_TIMEOUT") {
            let secs = timeout.parse().with_context(|| {
                format!(
                    "{}: invalid duration '{timeout}'",
                    process_env_key(name, "STOP_TIMEOUT")
                )
            })?;
            self.stop_timeout = Some(secs);
        }
        if let Some(log_path) = get("LOG_PATH") {
            self.log_path = Some(PathBuf::from(log_path));
        }
        Ok(())
    }
}

/// `DD_PROCSUP_<NAME>_<SUFFIX>` with the name upper-cased and `-`/`.` mapped to `_`.
pub fn process_env_key(name: &str, suffix: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("{ENV_PREFIX}_{name}_{suffix}")
}

/// Supervisor-wide settings, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config_dir: PathBuf,
    /// Default directory for pid and lock files.
    pub run_dir: PathBuf,
    /// Default directory for per-process logs.
    pub log_dir: PathBuf,
    pub stop_timeout: Duration,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let var = |suffix: &str| std::env::var(format!("{ENV_PREFIX}_{suffix}")).ok();
        let defaults = Settings::default();

        let stop_timeout = match var("STOP_TIMEOUT") {
            Some(raw) => {
                let secs: f64 = raw.parse().with_context(|| {
                    format!("{ENV_PREFIX}_STOP_TIMEOUT: invalid duration '{raw}'")
                })?;
                seconds(secs).with_context(|| format!("{ENV_PREFIX}_STOP_TIMEOUT"))?
            }
            None => defaults.stop_timeout,
        };

        // DD_PROCSUP_LOG_LEVEL > RUST_LOG > default
        let log_level = var("LOG_LEVEL")
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or(defaults.log_level);

        Ok(Self {
            config_dir: var("CONFIG_DIR").map(PathBuf::from).unwrap_or(defaults.config_dir),
            run_dir: var("RUN_DIR").map(PathBuf::from).unwrap_or(defaults.run_dir),
            log_dir: var("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            stop_timeout,
            log_level,
        })
    }
}

/// Convert a config duration in seconds, rejecting negative and non-finite values.
pub fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("invalid duration {secs}s"))
}

/// Scan a directory for `*.yaml` files and parse each into a ProcessConfig.
/// The process name is derived from the filename (without extension).
/// Files that fail to parse are logged and skipped.
pub fn load_configs(dir: &Path) -> Result<Vec<(String, ProcessConfig)>> {
    let mut configs = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read config directory: {}", dir.display()))?;

    let mut yaml_files: Vec<_> = entries
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping unreadable entry in {}: {e}", dir.display());
                None
            }
        })
        .filter(|e| {
            let is_yaml = e
                .path()
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                debug!("skipping non-YAML file: {}", e.path().display());
            }
            is_yaml
        })
        .collect();

    yaml_files.sort_by_key(|e| e.file_name());

    for entry in yaml_files {
        let path = entry.path();
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!("skipping {}: file name is not valid UTF-8", path.display());
            continue;
        };

        match parse_config(&path) {
            Ok(config) => configs.push((name.to_string(), config)),
            Err(e) => warn!("skipping {}: {e:#}", path.display()),
        }
    }

    Ok(configs)
}

fn parse_config(path: &Path) -> Result<ProcessConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: ProcessConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
