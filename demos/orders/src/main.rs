//! Orders demo server
//!
//! An order and charge API whose mutating endpoints honour the
//! `Idempotency-Key` header.
//!
//! # Usage
//!
//! ```bash
//! docker run -d -p 5432:5432 -e POSTGRES_PASSWORD=postgres -e POSTGRES_DB=orders postgres:16
//! cargo run -p orders-demo
//!
//! curl -X POST localhost:8080/orders \
//!   -H 'Content-Type: application/json' \
//!   -H 'Idempotency-Key: 11111111-1111-1111-1111-111111111111' \
//!   -d '{"item":"widget","quantity":2}'
//! ```

mod config;
mod routes;

use config::Config;
use idempotency_core::IdempotencyCoordinator;
use idempotency_postgres::PostgresIdempotencyStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orders_demo=debug,idempotency_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind_addr = %config.bind_addr,
        lock_timeout = ?config.idempotency.lock_timeout,
        release_policy = ?config.idempotency.release_policy,
        "Configuration loaded"
    );

    let store = PostgresIdempotencyStore::connect(&config.database_url, config.max_connections).await?;
    store.migrate().await?;
    routes::prepare_schema(store.pool()).await?;

    let coordinator =
        IdempotencyCoordinator::with_system_clock(Arc::new(store), config.idempotency.clone());
    spawn_purge(coordinator.clone(), config.retention, config.purge_interval);

    let app = routes::router(coordinator, config.web);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Orders demo listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down gracefully...");
        })
        .await?;
    Ok(())
}

/// Periodically delete finished records older than `retention`.
fn spawn_purge(
    coordinator: IdempotencyCoordinator<PostgresIdempotencyStore>,
    retention: Duration,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(error) = coordinator.purge_finished_before(retention).await {
                tracing::warn!(%error, "Failed to purge idempotency records");
            }
        }
    });
}
