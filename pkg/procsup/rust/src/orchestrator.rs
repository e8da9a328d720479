// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Multi-process commands composed from per-process lifecycle operations.

use crate::error::{Result, SupervisorError};
use crate::process;
use crate::readiness::ReadinessStatus;
use crate::retry::poll_until;
use crate::shutdown::{self, Termination};
use crate::spec::ProcessSpec;
use crate::state::ProcessState;
use crate::supervisor::{StartOutcome, StopOutcome, Supervisor};
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Processes to act on, in start order.
///
/// With no names, every registered process. Otherwise the named ones plus
/// everything they must start after. Ties keep configuration order.
pub fn start_order<'a>(
    specs: &'a [ProcessSpec],
    names: &[String],
) -> Result<Vec<&'a ProcessSpec>> {
    for spec in specs {
        for dep in &spec.after {
            if position(specs, dep).is_none() {
                return Err(SupervisorError::config(
                    &spec.name,
                    format!("`after` references unknown process '{dep}'"),
                ));
            }
        }
    }

    let mut selected = vec![names.is_empty(); specs.len()];
    let mut queue = Vec::new();
    for name in names {
        let idx = position(specs, name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.clone()))?;
        queue.push(idx);
    }
    while let Some(idx) = queue.pop() {
        if selected[idx] {
            continue;
        }
        selected[idx] = true;
        queue.extend(specs[idx].after.iter().filter_map(|dep| position(specs, dep)));
    }

    // Kahn's algorithm, always taking the earliest ready process.
    let mut in_degree: Vec<usize> = specs
        .iter()
        .map(|s| {
            s.after
                .iter()
                .filter(|d| position(specs, d).is_some_and(|i| selected[i]))
                .count()
        })
        .collect();
    let mut done = vec![false; specs.len()];
    let mut order = Vec::new();
    let total = selected.iter().filter(|s| **s).count();

    while order.len() < total {
        let Some(next) = (0..specs.len()).find(|&i| selected[i] && !done[i] && in_degree[i] == 0)
        else {
            let cycle: Vec<_> = (0..specs.len())
                .filter(|&i| selected[i] && !done[i])
                .map(|i| specs[i].name.as_str())
                .collect();
            return Err(SupervisorError::config(
                cycle.join(","),
                format!("dependency cycle between {}", cycle.join(", ")),
            ));
        };
        done[next] = true;
        order.push(&specs[next]);
        for (i, spec) in specs.iter().enumerate() {
            if selected[i] && !done[i] {
                in_degree[i] -= spec.after.iter().filter(|d| **d == specs[next].name).count();
            }
        }
    }

    Ok(order)
}

fn position(specs: &[ProcessSpec], name: &str) -> Option<usize> {
    specs.iter().position(|s| s.name == name)
}

/// Start processes in dependency order. The first failure aborts; processes
/// already started are left running.
pub async fn up(
    supervisor: &Supervisor,
    names: &[String],
) -> Result<Vec<(String, StartOutcome)>> {
    let order = start_order(supervisor.specs(), names)?;
    let mut started = Vec::with_capacity(order.len());

    for spec in order {
        let outcome = supervisor.start(&spec.name).await.inspect_err(|e| {
            error!(process = %spec.name, "up aborted: {e}");
        })?;
        match outcome {
            StartOutcome::Started { pid } => info!(process = %spec.name, pid, "up: started"),
            StartOutcome::AlreadyRunning { pid } => {
                info!(process = %spec.name, pid, "up: already running")
            }
        }

        if let Some(timeout) = spec.ready_timeout
            && spec.readiness.is_some()
        {
            wait_ready(supervisor, spec, outcome.pid(), timeout).await?;
        }
        started.push((spec.name.clone(), outcome));
    }
    Ok(started)
}

enum Readiness {
    Pending(String),
    Ready,
    Failed(String),
}

async fn wait_ready(
    supervisor: &Supervisor,
    spec: &ProcessSpec,
    pid: u32,
    timeout: Duration,
) -> Result<()> {
    info!(process = %spec.name, timeout_secs = timeout.as_secs_f64(), "waiting for readiness");
    let started = Instant::now();
    let state = Mutex::new(Readiness::Pending("not probed".to_string()));
    let state_ref = &state;

    poll_until(READY_POLL_INTERVAL, timeout, move || async move {
        let next = if !supervisor.executor().is_alive(pid) {
            Readiness::Failed("process exited".to_string())
        } else {
            match supervisor.probe(&spec.name).await {
                Ok(Some(ReadinessStatus::Ready)) | Ok(None) => Readiness::Ready,
                Ok(Some(ReadinessStatus::NotReady(reason))) => Readiness::Pending(reason),
                Err(err) => Readiness::Failed(err.to_string()),
            }
        };
        let settled = !matches!(next, Readiness::Pending(_));
        *state_ref.lock().unwrap_or_else(|e| e.into_inner()) = next;
        settled
    })
    .await;

    match state.into_inner().unwrap_or_else(|e| e.into_inner()) {
        Readiness::Ready => {
            info!(process = %spec.name, "ready");
            Ok(())
        }
        Readiness::Pending(last) | Readiness::Failed(last) => {
            Err(SupervisorError::ReadinessTimeout {
                process: spec.name.clone(),
                waited: started.elapsed(),
                last,
            })
        }
    }
}

/// Stop processes in reverse start order. Failures are logged and the rest
/// are still stopped.
pub async fn down(
    supervisor: &Supervisor,
    names: &[String],
) -> Result<Vec<(String, Result<StopOutcome>)>> {
    let order = start_order(supervisor.specs(), &[])?;
    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    for name in &wanted {
        supervisor.registry().spec(name)?;
    }

    let mut results = Vec::new();
    for spec in order.into_iter().rev() {
        if !wanted.is_empty() && !wanted.contains(spec.name.as_str()) {
            continue;
        }
        let result = supervisor.stop(&spec.name).await;
        if let Err(e) = &result {
            warn!(process = %spec.name, "down: stop failed, continuing: {e}");
        }
        results.push((spec.name.clone(), result));
    }
    Ok(results)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevOutcome {
    /// A detached instance already holds the pid file.
    AlreadyRunning { pid: u32 },
    /// The child exited on its own.
    Exited { code: Option<i32> },
    /// The child was stopped after `shutdown` fired.
    Stopped { forced: bool },
    /// The child survived SIGKILL; its pid file is kept.
    StillRunning { pid: u32 },
}

/// Run the dev variant of `name` in the foreground until it exits or
/// `shutdown` is cancelled.
pub async fn dev(
    supervisor: &Supervisor,
    name: &str,
    shutdown: CancellationToken,
) -> Result<DevOutcome> {
    let registry = supervisor.registry();
    let spec = registry.spec(name)?.for_dev();

    let (mut child, pid) = {
        // Held only while checking and recording, so `stop` from another
        // shell can still reach the foreground child.
        let _lock = registry.lock(&spec).await?;
        if let Some(pid) = registry.refresh(&spec, supervisor.executor())? {
            warn!(process = name, pid, "refusing dev run, already running");
            return Ok(DevOutcome::AlreadyRunning { pid });
        }

        process::validate_launch(&spec)?;
        registry.transition(name, ProcessState::Starting, None)?;
        let mut child = match process::spawn_foreground(&spec) {
            Ok(child) => child,
            Err(e) => {
                registry.transition(name, ProcessState::Stopped, None)?;
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            registry.transition(name, ProcessState::Stopped, None)?;
            return Ok(DevOutcome::Exited { code: None });
        };
        if let Err(e) = registry.store().write(&spec, pid) {
            error!(process = name, pid, "failed to record pid, killing dev process: {e}");
            if let Err(kill_err) = child.start_kill() {
                error!(process = name, pid, "failed to kill dev process: {kill_err}");
            } else if let Err(wait_err) = child.wait().await {
                warn!(process = name, pid, "failed to reap dev process: {wait_err}");
            }
            registry.transition(name, ProcessState::Stopped, None)?;
            return Err(e);
        }
        registry.transition(name, ProcessState::Running, Some(pid))?;
        (child, pid)
    };

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = shutdown.cancelled() => None,
    };

    let outcome = match exited {
        Some(status) => {
            let status = status.map_err(|e| SupervisorError::io(format!("wait for {name}"), e))?;
            info!(process = name, pid, %status, "dev process exited");
            DevOutcome::Exited {
                code: status.code(),
            }
        }
        None => {
            info!(process = name, pid, "forwarding shutdown to dev process");
            registry.transition(name, ProcessState::Stopping, Some(pid))?;
            match shutdown::terminate(supervisor.executor(), &spec, pid).await? {
                Termination::Survived => {
                    registry.transition(name, ProcessState::Running, Some(pid))?;
                    return Ok(DevOutcome::StillRunning { pid });
                }
                termination => {
                    if let Err(e) = child.wait().await {
                        warn!(process = name, pid, "failed to reap dev process: {e}");
                    }
                    DevOutcome::Stopped {
                        forced: termination == Termination::Forced,
                    }
                }
            }
        }
    };

    let _lock = registry.lock(&spec).await?;
    if registry.store().read(&spec)? == Some(pid) {
        registry.store().remove(&spec)?;
    }
    registry.force_stopped(name);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pidfile::{InMemoryPidStore, PidStore};
    use crate::process::UnixExecutor;
    use crate::readiness::ReadinessCheck;
    use crate::testing::{FailingPidStore, RecordingExecutor, ScriptedProbe};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fake_spec(name: &str, after: &[&str]) -> ProcessSpec {
        let mut spec = ProcessSpec::new(name, "/bin/sh", Path::new("/tmp/procsup-orchestrator"));
        spec.after = after.iter().map(|s| s.to_string()).collect();
        spec
    }

    fn names(order: &[&ProcessSpec]) -> Vec<String> {
        order.iter().map(|s| s.name.clone()).collect()
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn fake_supervisor(
        specs: Vec<ProcessSpec>,
    ) -> (Supervisor, Arc<RecordingExecutor>, Arc<ScriptedProbe>) {
        let executor = Arc::new(RecordingExecutor::new());
        let probe = Arc::new(ScriptedProbe::default());
        let supervisor = Supervisor::new(
            specs,
            Arc::new(InMemoryPidStore::new()),
            executor.clone(),
            probe.clone(),
        )
        .unwrap();
        (supervisor, executor, probe)
    }

    // -- ordering --

    #[test]
    fn test_order_respects_after_and_config_order() {
        let specs = vec![
            fake_spec("gateway", &["llm", "web"]),
            fake_spec("web", &[]),
            fake_spec("llm", &[]),
        ];
        let order = start_order(&specs, &[]).unwrap();
        assert_eq!(names(&order), vec!["web", "llm", "gateway"]);
    }

    #[test]
    fn test_order_pulls_in_dependencies() {
        let specs = vec![
            fake_spec("llm", &[]),
            fake_spec("gateway", &["llm"]),
            fake_spec("unrelated", &[]),
        ];
        let order = start_order(&specs, &strings(&["gateway"])).unwrap();
        assert_eq!(names(&order), vec!["llm", "gateway"]);
    }

    #[test]
    fn test_order_rejects_cycle() {
        let specs = vec![fake_spec("a", &["b"]), fake_spec("b", &["a"]), fake_spec("c", &[])];
        let err = start_order(&specs, &[]).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("dependency cycle between a, b"));
    }

    #[test]
    fn test_order_rejects_unknown_dependency() {
        let specs = vec![fake_spec("a", &["ghost"])];
        let err = start_order(&specs, &[]).unwrap_err();
        assert!(err.to_string().contains("unknown process 'ghost'"));
    }

    #[test]
    fn test_order_rejects_unknown_name() {
        let specs = vec![fake_spec("a", &[])];
        assert!(matches!(
            start_order(&specs, &strings(&["zzz"])),
            Err(SupervisorError::UnknownProcess(_))
        ));
    }

    // -- up / down --

    #[tokio::test]
    async fn test_up_starts_in_order() {
        let (supervisor, executor, _) =
            fake_supervisor(vec![fake_spec("gateway", &["llm"]), fake_spec("llm", &[])]);

        let started = up(&supervisor, &[]).await.unwrap();
        let order: Vec<_> = started.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["llm", "gateway"]);
        let spawned: Vec<_> = executor.spawned().into_iter().map(|(n, _)| n).collect();
        assert_eq!(spawned, vec!["llm", "gateway"]);
    }

    #[tokio::test]
    async fn test_up_is_fail_fast() {
        let mut broken = fake_spec("web", &["llm"]);
        broken.inputs = vec!["/nonexistent/input".into()];
        let (supervisor, executor, _) = fake_supervisor(vec![
            fake_spec("llm", &[]),
            broken,
            fake_spec("gateway", &["web"]),
        ]);

        let err = up(&supervisor, &[]).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(executor.spawn_count("llm"), 1);
        assert_eq!(executor.spawn_count("gateway"), 0);
        // Earlier processes stay up.
        assert_eq!(executor.live_count(), 1);
    }

    #[tokio::test]
    async fn test_up_twice_is_idempotent() {
        let (supervisor, executor, _) = fake_supervisor(vec![fake_spec("llm", &[])]);
        up(&supervisor, &[]).await.unwrap();
        let second = up(&supervisor, &[]).await.unwrap();
        assert!(matches!(second[0].1, StartOutcome::AlreadyRunning { .. }));
        assert_eq!(executor.spawn_count("llm"), 1);
    }

    fn with_readiness(mut spec: ProcessSpec, port: u16, ready_timeout: Duration) -> ProcessSpec {
        spec.readiness = Some(ReadinessCheck::Tcp {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_millis(100),
        });
        spec.ready_timeout = Some(ready_timeout);
        spec
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_waits_for_readiness() {
        let llm = with_readiness(fake_spec("llm", &[]), 8080, Duration::from_secs(2));
        let (supervisor, executor, probe) =
            fake_supervisor(vec![llm, fake_spec("gateway", &["llm"])]);
        probe.set_ready("tcp://127.0.0.1:8080");

        up(&supervisor, &[]).await.unwrap();
        assert_eq!(executor.spawn_count("gateway"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_readiness_timeout_aborts() {
        let llm = with_readiness(fake_spec("llm", &[]), 8080, Duration::from_secs(2));
        let (supervisor, executor, _) =
            fake_supervisor(vec![llm, fake_spec("gateway", &["llm"])]);

        let err = up(&supervisor, &[]).await.unwrap_err();
        match err {
            SupervisorError::ReadinessTimeout { process, last, .. } => {
                assert_eq!(process, "llm");
                assert_eq!(last, "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executor.spawn_count("gateway"), 0);
    }

    #[tokio::test]
    async fn test_down_reverse_order_and_best_effort() {
        let (supervisor, executor, _) =
            fake_supervisor(vec![fake_spec("gateway", &["llm"]), fake_spec("llm", &[])]);
        up(&supervisor, &[]).await.unwrap();

        let results = down(&supervisor, &[]).await.unwrap();
        let order: Vec<_> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["gateway", "llm"]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(executor.live_count(), 0);

        // Nothing running: every stop is a no-op.
        let results = down(&supervisor, &[]).await.unwrap();
        assert!(
            results
                .iter()
                .all(|(_, r)| matches!(r, Ok(StopOutcome::NotRunning)))
        );
    }

    #[tokio::test]
    async fn test_down_selected_names() {
        let (supervisor, executor, _) =
            fake_supervisor(vec![fake_spec("a", &[]), fake_spec("b", &[])]);
        up(&supervisor, &[]).await.unwrap();

        let results = down(&supervisor, &strings(&["b"])).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "b");
        assert_eq!(executor.live_count(), 1);
    }

    // -- dev --

    fn real_supervisor(specs: Vec<ProcessSpec>) -> (Supervisor, Arc<InMemoryPidStore>) {
        let store = Arc::new(InMemoryPidStore::new());
        let supervisor = Supervisor::new(
            specs,
            store.clone(),
            Arc::new(UnixExecutor),
            Arc::new(ScriptedProbe::default()),
        )
        .unwrap();
        (supervisor, store)
    }

    #[tokio::test]
    async fn test_dev_runs_variant_to_completion() {
        let dir = TempDir::new().unwrap();
        let mut spec = ProcessSpec::new("web", "/bin/sh", dir.path()).with_args(["-c", "exit 1"]);
        spec.dev = Some(crate::spec::DevVariant {
            command: "/bin/sh".to_string(),
            args: strings(&["-c", "exit 3"]),
            env: Vec::new(),
        });
        let (supervisor, store) = real_supervisor(vec![spec.clone()]);

        let outcome = dev(&supervisor, "web", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DevOutcome::Exited { code: Some(3) });
        assert_eq!(store.read(&spec).unwrap(), None);
        assert_eq!(supervisor.registry().record("web").state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_dev_forwards_shutdown() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("web", "/bin/sleep", dir.path()).with_args(["30"]);
        let (supervisor, store) = real_supervisor(vec![spec.clone()]);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = dev(&supervisor, "web", shutdown).await.unwrap();
        assert_eq!(outcome, DevOutcome::Stopped { forced: false });
        assert_eq!(store.read(&spec).unwrap(), None);
    }

    #[tokio::test]
    async fn test_dev_refuses_when_running() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("web", "/bin/sleep", dir.path()).with_args(["30"]);
        let (supervisor, store) = real_supervisor(vec![spec.clone()]);
        let me = std::process::id();
        store.write(&spec, me).unwrap();

        let outcome = dev(&supervisor, "web", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DevOutcome::AlreadyRunning { pid: me });
        assert_eq!(store.read(&spec).unwrap(), Some(me));
    }

    #[tokio::test]
    async fn test_dev_kills_child_when_pid_write_fails() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("web", "/bin/sleep", dir.path()).with_args(["30"]);
        let store = Arc::new(FailingPidStore::default());
        let supervisor = Supervisor::new(
            vec![spec],
            store.clone(),
            Arc::new(UnixExecutor),
            Arc::new(ScriptedProbe::default()),
        )
        .unwrap();

        let err = dev(&supervisor, "web", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Io { .. }), "got {err:?}");

        let pid = store.attempted().expect("dev should have tried to record a pid");
        assert!(!process::pid_is_alive(pid));
        assert_eq!(supervisor.registry().record("web").state, ProcessState::Stopped);
    }
}
