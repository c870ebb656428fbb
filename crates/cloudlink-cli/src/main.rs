//! # cloudlink
//!
//! Keeps a cloud variable session open and bridges it to a local HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! # Run with ./cloudlink.toml or ~/.config/cloudlink/cloudlink.toml
//! cloudlink
//!
//! # Run with a custom config
//! CLOUDLINK_CONFIG=/path/to/cloudlink.toml cloudlink
//!
//! # Run with environment variables
//! CLOUDLINK_USERNAME=alice CLOUDLINK_PROJECT_ID=1234 CLOUDLINK_SESSION_ID=... cloudlink
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use cloudlink_core::{CloudEvent, CloudSession, EventKind, Handler};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    let identity = config.identity()?;

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    info!(
        "Connecting to {} as {} (project {})",
        config.cloud.url, identity.username, identity.project_id
    );

    let session = CloudSession::new(identity, config.session_config());
    session.on(
        EventKind::Change,
        Handler::sync(|event: &CloudEvent| {
            if let Some(variable) = event.variable() {
                info!(name = %variable.display_name(), value = %variable.value, "Variable changed");
            }
        }),
    );
    session.on(
        EventKind::Disconnect,
        Handler::sync(|event: &CloudEvent| {
            if let CloudEvent::Disconnect(reason) = event {
                warn!("Connection lost: {}", reason);
            }
        }),
    );
    if config.metrics.enabled {
        metrics::observe(&session);
    }

    session
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.cloud.url))?;
    info!("Synced {} variables", session.len());

    if config.status.enabled {
        let addr = config.status_addr()?;
        handlers::run_status_server(session.clone(), addr, shutdown_signal()).await?;
    } else {
        shutdown_signal().await;
    }

    info!("Shutting down");
    session.close().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}
