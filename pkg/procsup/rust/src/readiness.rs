// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Readiness probes: is the process actually serving, not just alive.
//! Results are advisory and never change a process's lifecycle state.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessCheck {
    Tcp {
        host: String,
        port: u16,
        timeout: Duration,
    },
    Http {
        url: String,
        expected_status: u16,
        timeout: Duration,
    },
}

impl ReadinessCheck {
    pub fn target(&self) -> String {
        match self {
            Self::Tcp { host, port, .. } => format!("tcp://{host}:{port}"),
            Self::Http { url, .. } => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ReadinessStatus {
    Ready,
    NotReady(String),
}

impl ReadinessStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for ReadinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::NotReady(reason) => write!(f, "not ready ({reason})"),
        }
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, check: &ReadinessCheck) -> ReadinessStatus;
}

/// TCP connect via tokio, HTTP via a blocking ureq agent on the blocking pool.
#[derive(Debug, Default)]
pub struct NetworkProbe;

#[async_trait]
impl ReadinessProbe for NetworkProbe {
    async fn probe(&self, check: &ReadinessCheck) -> ReadinessStatus {
        match check {
            ReadinessCheck::Tcp {
                host,
                port,
                timeout,
            } => probe_tcp(host, *port, *timeout).await,
            ReadinessCheck::Http {
                url,
                expected_status,
                timeout,
            } => probe_http(url, *expected_status, *timeout).await,
        }
    }
}

async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> ReadinessStatus {
    let addr = format!("{host}:{port}");
    debug!(%addr, "probing tcp readiness");

    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => ReadinessStatus::Ready,
        Ok(Err(e)) => ReadinessStatus::NotReady(format!("connect {addr}: {e}")),
        Err(_) => ReadinessStatus::NotReady(format!(
            "connect {addr}: timed out after {}ms",
            timeout.as_millis()
        )),
    }
}

async fn probe_http(url: &str, expected_status: u16, timeout: Duration) -> ReadinessStatus {
    debug!(%url, expected_status, "probing http readiness");

    let url = url.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        match agent.get(&url).call() {
            Ok(resp) => Ok(resp.status()),
            // ureq reports non-2xx as errors; the status is still an answer.
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(e) => Err(format!("GET {url}: {e}")),
        }
    })
    .await;

    match result {
        Ok(Ok(status)) if status == expected_status => ReadinessStatus::Ready,
        Ok(Ok(status)) => {
            ReadinessStatus::NotReady(format!("expected HTTP {expected_status}, got {status}"))
        }
        Ok(Err(reason)) => ReadinessStatus::NotReady(reason),
        Err(e) => {
            error!("http probe task failed: {e}");
            ReadinessStatus::NotReady(format!("probe task failed: {e}"))
        }
    }
}
