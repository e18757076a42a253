// ABOUTME: Server binary wiring config, database, workers, and the HTTP listener
// ABOUTME: Runs until SIGINT; workers are independent tasks that never crash the process
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use anyhow::{Context, Result};
use tracing::info;

use tollgate::config::ServerConfig;
use tollgate::context::ServerResources;
use tollgate::database::Database;
use tollgate::{logging, routes, workers};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = ServerConfig::from_env().context("Failed to load configuration")?;
    let http_port = config.http_port;

    let database = Database::new(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to initialize database")?;

    let resources =
        ServerResources::new(config, database).context("Failed to assemble server resources")?;

    let worker_handles = workers::spawn_workers(&resources);
    info!(count = worker_handles.len(), "Background workers started");

    let app = routes::router(resources);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port))
        .await
        .with_context(|| format!("Failed to bind port {http_port}"))?;

    info!(port = http_port, "Tollgate server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    for handle in worker_handles {
        handle.abort();
    }

    Ok(())
}
