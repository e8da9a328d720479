// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use dd_procsup::cli::{Cli, Command};
use dd_procsup::config::Settings;
use dd_procsup::logs::TailOptions;
use dd_procsup::orchestrator::{self, DevOutcome};
use dd_procsup::spec;
use dd_procsup::{StartOutcome, StopOutcome, Supervisor};
use std::process::ExitCode;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut settings = Settings::from_env()?;
    cli.apply(&mut settings);
    dd_procsup::logging::init(&settings.log_level);
    debug!(
        config_dir = %settings.config_dir.display(),
        run_dir = %settings.run_dir.display(),
        log_dir = %settings.log_dir.display(),
        "dd-procsup {}",
        env!("CARGO_PKG_VERSION")
    );

    let specs = spec::load_specs(&settings)
        .with_context(|| format!("loading {}", settings.config_dir.display()))?;
    let supervisor = Supervisor::system(specs)?;

    match cli.command {
        Command::Start { name } => start(&supervisor, &name).await,
        Command::Stop { name } => stop(&supervisor, &name).await,
        Command::Restart { name } => restart(&supervisor, &name).await,
        Command::Status { name, json } => status(&supervisor, name.as_deref(), json).await,
        Command::Logs {
            name,
            lines,
            no_follow,
        } => logs(&supervisor, &name, lines, !no_follow).await,
        Command::Up { names } => up(&supervisor, &names).await,
        Command::Down { names } => down(&supervisor, &names).await,
        Command::Dev { name } => dev(&supervisor, &name).await,
        Command::List => {
            list(&supervisor);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_start(name: &str, outcome: StartOutcome) {
    match outcome {
        StartOutcome::Started { pid } => println!("{name}: started (pid {pid})"),
        StartOutcome::AlreadyRunning { pid } => println!("{name}: already running (pid {pid})"),
    }
}

fn report_stop(name: &str, outcome: StopOutcome) {
    match outcome {
        StopOutcome::NotRunning => println!("{name}: not running"),
        StopOutcome::Stopped { pid, forced: false } => println!("{name}: stopped (pid {pid})"),
        StopOutcome::Stopped { pid, forced: true } => {
            println!("{name}: stopped (pid {pid}, killed after stop timeout)")
        }
        StopOutcome::StillRunning { pid } => {
            eprintln!("{name}: pid {pid} still running after SIGKILL, pid file kept")
        }
    }
}

async fn start(supervisor: &Supervisor, name: &str) -> Result<ExitCode> {
    report_start(name, supervisor.start(name).await?);
    Ok(ExitCode::SUCCESS)
}

/// Best-effort: only a bad process name fails.
async fn stop(supervisor: &Supervisor, name: &str) -> Result<ExitCode> {
    match supervisor.stop(name).await {
        Ok(outcome) => report_stop(name, outcome),
        Err(e) if e.is_configuration() => return Err(e.into()),
        Err(e) => eprintln!("warning: {e}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn restart(supervisor: &Supervisor, name: &str) -> Result<ExitCode> {
    report_start(name, supervisor.restart(name).await?);
    Ok(ExitCode::SUCCESS)
}

async fn status(supervisor: &Supervisor, name: Option<&str>, json: bool) -> Result<ExitCode> {
    let statuses = match name {
        Some(name) => vec![supervisor.status(name).await?],
        None => supervisor.status_all().await?,
    };

    if json {
        let out = match (name, statuses.as_slice()) {
            (Some(_), [single]) => serde_json::to_string_pretty(single)?,
            _ => serde_json::to_string_pretty(&statuses)?,
        };
        println!("{out}");
    } else {
        for status in &statuses {
            println!("{status}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn logs(supervisor: &Supervisor, name: &str, lines: usize, follow: bool) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    if follow {
        cancel_on_signal(cancel.clone())?;
    }
    let mut tail = supervisor.tail_logs(name, TailOptions { lines, follow }, cancel)?;
    while let Some(line) = tail.next().await {
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn up(supervisor: &Supervisor, names: &[String]) -> Result<ExitCode> {
    for (name, outcome) in orchestrator::up(supervisor, names).await? {
        report_start(&name, outcome);
    }
    Ok(ExitCode::SUCCESS)
}

async fn down(supervisor: &Supervisor, names: &[String]) -> Result<ExitCode> {
    let mut failed = false;
    for (name, result) in orchestrator::down(supervisor, names).await? {
        match result {
            Ok(outcome) => {
                failed |= matches!(outcome, StopOutcome::StillRunning { .. });
                report_stop(&name, outcome);
            }
            Err(e) => {
                failed = true;
                eprintln!("{name}: {e}");
            }
        }
    }
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn dev(supervisor: &Supervisor, name: &str) -> Result<ExitCode> {
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone())?;

    let code = match orchestrator::dev(supervisor, name, shutdown).await? {
        DevOutcome::AlreadyRunning { pid } => {
            eprintln!("{name}: already running in the background (pid {pid}), stop it first");
            ExitCode::FAILURE
        }
        DevOutcome::Exited { code: Some(0) } | DevOutcome::Stopped { .. } => ExitCode::SUCCESS,
        DevOutcome::Exited { code } => {
            match code {
                Some(code) => eprintln!("{name}: exited with code {code}"),
                None => eprintln!("{name}: killed by a signal"),
            }
            ExitCode::FAILURE
        }
        DevOutcome::StillRunning { pid } => {
            eprintln!("{name}: pid {pid} still running after SIGKILL");
            ExitCode::FAILURE
        }
    };
    Ok(code)
}

fn list(supervisor: &Supervisor) {
    for spec in supervisor.specs() {
        println!("{}", spec.name);
        if let Some(description) = &spec.description {
            println!("  description: {description}");
        }
        println!("  command:     {} {}", spec.command, spec.args.join(" "));
        println!("  pid file:    {}", spec.pid_file.display());
        println!("  log:         {}", spec.log_path.display());
        if let Some(address) = spec.address() {
            println!("  address:     {address}");
        }
        if !spec.after.is_empty() {
            println!("  after:       {}", spec.after.join(", "));
        }
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        token.cancel();
    });
    Ok(())
}
