// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use benchd::config::BenchConfig;
use benchd::ws::logs::{LogLevel, LogRing, LogRingLayer};

#[tokio::main]
async fn main() {
    let config = BenchConfig::parse();

    let fmt_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = if config.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // The ring feeds `/ws` log frames independent of how stdout is formatted,
    // so it's its own layer rather than something bolted onto `fmt` — and the
    // same `Arc` is handed to `run()` so `logs.history`/`logs.append` read the
    // very ring every `tracing` call writes into, not a second one.
    let logs = LogRing::with_redactor(
        config.client_logs_capacity,
        config.log_channel_allowlist(),
        LogLevel::parse(&config.log_level_min),
        config.log_redact_pattern.as_deref(),
    );

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(LogRingLayer::new(logs.clone()))
        .init();

    if let Err(e) = benchd::run(config, logs).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
