// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Resolved, validated process definitions.

use crate::config::{self, DevConfig, ProcessConfig, ReadinessConfig, Settings};
use crate::error::{Result, SupervisorError};
use crate::readiness::{DEFAULT_PROBE_TIMEOUT, ReadinessCheck};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";

/// Which processes receive the stop signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KillMode {
    /// Signal the whole process group. Children are started as session
    /// leaders, so this reaches everything they fork.
    #[default]
    ProcessGroup,
    /// Signal only the main pid. Grandchildren may be orphaned.
    Process,
}

impl fmt::Display for KillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessGroup => write!(f, "process-group"),
            Self::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DevVariant {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub log_path: PathBuf,
    pub pid_file: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub readiness: Option<ReadinessCheck>,
    pub stop_timeout: Duration,
    pub kill_mode: KillMode,
    pub after: Vec<String>,
    pub ready_timeout: Option<Duration>,
    pub dev: Option<DevVariant>,
}

impl ProcessSpec {
    /// Bare spec with its pid and log files placed under `state_dir`.
    pub fn new(name: impl Into<String>, command: impl Into<String>, state_dir: &Path) -> Self {
        let name = name.into();
        Self {
            log_path: state_dir.join(format!("{name}.log")),
            pid_file: state_dir.join(format!("{name}.pid")),
            name,
            description: None,
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            inputs: Vec::new(),
            host: None,
            port: None,
            readiness: None,
            stop_timeout: config::DEFAULT_STOP_TIMEOUT,
            kill_mode: KillMode::default(),
            after: Vec::new(),
            ready_timeout: None,
            dev: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_config(name: &str, cfg: ProcessConfig, settings: &Settings) -> Result<Self> {
        if cfg.command.trim().is_empty() {
            return Err(SupervisorError::config(name, "command is empty"));
        }

        let duration = |field: &str, secs: f64| {
            config::seconds(secs)
                .map_err(|e| SupervisorError::config(name, format!("{field}: {e:#}")))
        };

        let stop_timeout = match cfg.stop_timeout {
            Some(secs) => duration("stop_timeout", secs)?,
            None => settings.stop_timeout,
        };
        let ready_timeout = cfg
            .ready_timeout
            .map(|secs| duration("ready_timeout", secs))
            .transpose()?;

        let log_path = match cfg.log_path {
            Some(path) => settings.log_dir.join(path),
            None => settings.log_dir.join(format!("{name}.log")),
        };
        let pid_file = match cfg.pidfile {
            Some(path) => settings.run_dir.join(path),
            None => settings.run_dir.join(format!("{name}.pid")),
        };

        // Relative inputs are what the child sees, i.e. relative to its working dir.
        let inputs = cfg
            .inputs
            .into_iter()
            .map(|p| match &cfg.working_dir {
                Some(dir) if p.is_relative() => dir.join(p),
                _ => p,
            })
            .collect();

        let readiness = match cfg.readiness {
            None => None,
            Some(ReadinessConfig::Tcp { timeout }) => {
                let port = cfg.port.ok_or_else(|| {
                    SupervisorError::config(name, "tcp readiness check requires `port`")
                })?;
                Some(ReadinessCheck::Tcp {
                    host: cfg.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
                    port,
                    timeout: probe_timeout(timeout, &duration)?,
                })
            }
            Some(ReadinessConfig::Http {
                url,
                path,
                expected_status,
                timeout,
            }) => {
                let host = cfg.host.as_deref().unwrap_or(DEFAULT_HOST);
                let url = match url {
                    // `{host}`/`{port}` placeholders follow the per-process overrides.
                    Some(url) => {
                        let url = url.replace("{host}", host);
                        match cfg.port {
                            Some(port) => url.replace("{port}", &port.to_string()),
                            None if url.contains("{port}") => {
                                return Err(SupervisorError::config(
                                    name,
                                    "readiness url uses {port} but no `port` is set",
                                ));
                            }
                            None => url,
                        }
                    }
                    None => {
                        let port = cfg.port.ok_or_else(|| {
                            SupervisorError::config(
                                name,
                                "http readiness check requires `url` or `port`",
                            )
                        })?;
                        format!("http://{host}:{port}{path}")
                    }
                };
                Some(ReadinessCheck::Http {
                    url,
                    expected_status,
                    timeout: probe_timeout(timeout, &duration)?,
                })
            }
        };

        let dev = cfg.dev.map(|dev| dev_variant(dev, &cfg.command, &cfg.args));

        Ok(Self {
            name: name.to_string(),
            description: cfg.description,
            command: cfg.command,
            args: cfg.args,
            env: sorted_env(cfg.env),
            working_dir: cfg.working_dir,
            log_path,
            pid_file,
            inputs,
            host: cfg.host,
            port: cfg.port,
            readiness,
            stop_timeout,
            kill_mode: cfg.kill_mode,
            after: cfg.after,
            ready_timeout,
            dev,
        })
    }

    /// `host:port` when a port is configured.
    pub fn address(&self) -> Option<String> {
        self.port.map(|port| {
            format!("{}:{port}", self.host.as_deref().unwrap_or(DEFAULT_HOST))
        })
    }

    /// Lock file serializing lifecycle operations on this process.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.pid_file.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// The spec `dev` runs: the dev variant's command and args, the rest unchanged.
    pub fn for_dev(&self) -> ProcessSpec {
        let mut spec = self.clone();
        if let Some(dev) = &self.dev {
            spec.command = dev.command.clone();
            spec.args = dev.args.clone();
            spec.env.extend(dev.env.iter().cloned());
        }
        spec
    }
}

/// Load every process definition under `settings.config_dir`, with
/// environment overrides applied, in config order.
pub fn load_specs(settings: &Settings) -> anyhow::Result<Vec<ProcessSpec>> {
    config::load_configs(&settings.config_dir)?
        .into_iter()
        .map(|(name, mut cfg)| {
            cfg.apply_overrides(&name, |key| std::env::var(key).ok())?;
            Ok(ProcessSpec::from_config(&name, cfg, settings)?)
        })
        .collect()
}

fn probe_timeout<F>(secs: Option<f64>, duration: &F) -> Result<Duration>
where
    F: Fn(&str, f64) -> Result<Duration>,
{
    secs.map(|s| duration("readiness.timeout", s))
        .transpose()
        .map(|t| t.unwrap_or(DEFAULT_PROBE_TIMEOUT))
}

fn dev_variant(dev: DevConfig, command: &str, args: &[String]) -> DevVariant {
    DevVariant {
        command: dev.command.unwrap_or_else(|| command.to_string()),
        args: dev.args.unwrap_or_else(|| args.to_vec()),
        env: sorted_env(dev.env),
    }
}

fn sorted_env(env: std::collections::HashMap<String, String>) -> Vec<(String, String)> {
    let mut env: Vec<_> = env.into_iter().collect();
    env.sort();
    env
}
