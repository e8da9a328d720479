// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Events go to stderr so command output on
/// stdout stays machine-readable. Falls back to `info` when `level` is not
/// a valid filter directive.
pub fn init(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("invalid log level '{level}' ({e}), using info");
        EnvFilter::new("info")
    });

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
