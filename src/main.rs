//! The PostgreSQL rolling upgrade agent.

mod app;
mod config;
mod error;
mod k8s;
mod render;
mod server;
#[cfg(test)]
mod server_test;
mod unit;
mod upgrade;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().compact().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let metrics = install_metrics_recorder(&cfg)?;

    tracing::info!(
        unit = %cfg.unit(),
        namespace = %cfg.namespace,
        http_port = %cfg.http_port,
        "starting PostgreSQL upgrade agent",
    );
    match App::new(cfg, metrics).await {
        Ok(app) => match app.spawn().await.context("error joining app handle").and_then(|res| res) {
            Ok(()) => (),
            Err(err) => tracing::error!(error = ?err),
        },
        Err(err) => tracing::error!(error = ?err, "error starting upgrade agent"),
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

/// Install the global Prometheus metrics recorder, returning a handle used for rendering.
fn install_metrics_recorder(config: &Config) -> Result<PrometheusHandle> {
    let recorder = PrometheusBuilder::new()
        .add_global_label("namespace", config.namespace.clone())
        .add_global_label("pod", config.pod_name.clone())
        .build();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error setting prometheus metrics recorder")?;
    Ok(handle)
}
