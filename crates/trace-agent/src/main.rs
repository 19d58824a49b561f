// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trace_agent::agent::Agent;
use trace_agent::config::Config;
use trace_agent::logger;
use trace_agent::watchdog::Watchdog;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(logger::env_filter(&log_level))
        .with_ansi(false)
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = start().await {
        error!("Trace agent failed: {e:#}");
        std::process::exit(1);
    }
}

async fn start() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);
    let agent = Agent::with_http(Arc::clone(&config))?;
    let watchdog = Watchdog::new(config.watchdog_config());
    let cancel = CancellationToken::new();

    agent.run();
    info!(
        "Trace agent started, writing to {} (env: {})",
        config.api_endpoint, config.env
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
            }
        }
        result = watchdog.run(cancel.clone()) => {
            if let Err(e) = result {
                error!("Exiting after watchdog breach: {e}");
                std::process::exit(1);
            }
        }
    }

    cancel.cancel();
    agent.stop().await;
    info!("Trace agent stopped");
    Ok(())
}
