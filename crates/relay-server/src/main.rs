//! # Relay Server
//!
//! Market-data relay: one upstream feed connection per instrument, fanned out
//! to any number of authenticated WebSocket sessions.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file in ./relay.toml or /etc/relay/relay.toml
//! relay
//!
//! # Run with environment variables
//! RELAY_AUTH__JWT_SECRET=change-me RELAY_PORT=8080 relay
//!
//! # Point at a different feed
//! RELAY_UPSTREAM__URL=ws://localhost:7000 RELAY_UPSTREAM__DIALECT=generic relay
//!
//! # Issue a session token for local testing
//! relay issue-token user-1 alice
//! ```

mod archive;
mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use relay_transport::WebSocketConnector;
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_core::{FeedArchive, NoopArchive, Router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tenvis_relay_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    config.validate().context("Invalid configuration")?;

    // `relay issue-token <subject> [username]` prints a session token and exits.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("issue-token") {
        let subject = args.get(1).context("Usage: relay issue-token <subject> [username]")?;
        let token = auth::JwtAuthenticator::new(&config.auth)
            .issue(subject, args.get(2).map(String::as_str))?;
        println!("{token}");
        return Ok(());
    }

    tracing::info!("Starting Relay server on {}:{}", config.host, config.port);
    tracing::info!(
        "Upstream feed: {} ({:?}, channels {:?})",
        config.upstream.url,
        config.upstream.dialect,
        config.upstream.channels
    );

    // Initialize metrics
    metrics::init_metrics();

    // Upstream transport
    let connector = WebSocketConnector::new(config.upstream.url.clone());

    // Archive
    let (archive, archive_writer) = if config.archive.enabled {
        let (archive, writer) =
            archive::JsonlArchive::open(&config.archive.path, config.archive.queue_capacity)
                .await
                .with_context(|| {
                    format!("Failed to open archive {}", config.archive.path.display())
                })?;
        tracing::info!("Archiving feed messages to {}", archive.path().display());
        (Arc::new(archive) as Arc<dyn FeedArchive>, Some(writer))
    } else {
        (Arc::new(NoopArchive) as Arc<dyn FeedArchive>, None)
    };

    // Router
    let (router, handle) = Router::new(config.router_config(), Arc::new(connector), archive);
    let router_task = router.spawn();

    if config.metrics.enabled {
        metrics::spawn_stats_reporter(
            handle.clone(),
            Duration::from_millis(config.metrics.report_interval_ms),
        );
    }

    // Start the server
    let authenticator = Arc::new(auth::JwtAuthenticator::new(&config.auth));
    let state = Arc::new(handlers::AppState::new(config, handle, authenticator));
    handlers::run_server(state).await?;

    router_task.await.context("Router task failed")?;
    if let Some(writer) = archive_writer {
        // Links release the archive as they finish closing.
        if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
            tracing::warn!("Archive writer did not finish in time");
        }
    }

    Ok(())
}
