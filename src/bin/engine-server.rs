//! Tripwire engine server
//!
//! Runs the condition engine with its HTTP API (query endpoint, instance
//! administration, snapshot ingest) and the `conditions` push channel.

use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tripwire::config::{self, EngineConfig};
use tripwire::core::{start_server, AppState, Dispatcher, ReaperScheduler};
use tripwire::logging;
use tripwire::metrics::Metrics;
use tripwire::services::{BroadcastPublisher, PushServer, PushServerConfig, SnapshotFeed};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if present
    dotenv().ok();
    logging::init_logging();

    let config = EngineConfig::from_env();
    let env = config::get_environment();
    info!("Starting Tripwire engine server");
    info!(environment = %env, "Environment");
    info!(
        http_port = config.http_port,
        ws_port = config.ws_port,
        workers = config.max_concurrent_evaluations,
        evaluate_irrelevant_groups = config.evaluate_irrelevant_groups,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);
    let publisher = Arc::new(BroadcastPublisher::new(config.publish_buffer));
    let dispatcher = Dispatcher::new(
        publisher.clone(),
        metrics.clone(),
        config.max_concurrent_evaluations,
        config.evaluation_options(),
    );

    if let Some(path) = &config.strategies_file {
        match config::load_definitions(path) {
            Ok(definitions) => {
                config::apply_definitions(&dispatcher, definitions).await;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load strategy definitions");
            }
        }
    }

    let feed = SnapshotFeed::new(dispatcher.clone(), config.feed_buffer);
    feed.start().await;

    let reaper = match ReaperScheduler::new(
        dispatcher.clone(),
        config.reap_interval_seconds,
        Duration::from_secs(config.terminal_retention_seconds),
    ) {
        Ok(reaper) => {
            reaper.start().await;
            Some(reaper)
        }
        Err(e) => {
            warn!(error = %e, "Terminal instance reaper not started");
            None
        }
    };

    let push_server = Arc::new(PushServer::new(
        PushServerConfig {
            port: config.ws_port,
            client_buffer: config.push_client_buffer,
            ..PushServerConfig::default()
        },
        dispatcher.clone(),
        publisher.clone(),
        metrics.clone(),
    ));
    let push_shutdown = push_server.shutdown_handle();
    let push_handle = {
        let push_server = push_server.clone();
        tokio::spawn(async move {
            if let Err(e) = push_server.run().await {
                error!(error = %e, "Push channel server error");
            }
        })
    };

    let state = AppState::new(dispatcher.clone(), metrics.clone(), feed.sender());
    let http_port = config.http_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(http_port, state).await {
            error!(error = %e, "HTTP server error");
        }
    });

    info!("Engine server started, waiting for shutdown signal...");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutting down engine server...");
        }
        _ = server_handle => {
            error!("HTTP server stopped");
        }
    }

    feed.stop().await;
    if let Some(reaper) = &reaper {
        reaper.stop().await;
    }
    let _ = push_shutdown.send(());
    let _ = push_handle.await;
    if tokio::time::timeout(Duration::from_secs(5), dispatcher.settle())
        .await
        .is_err()
    {
        warn!("Timed out waiting for in-flight evaluations");
    }
    info!("Engine server stopped");

    Ok(())
}
