/**
 * KELO COLLECTOR - Point d'entrée du collecteur de télémétrie
 *
 * RÔLE : Orchestration des modules : config, ingestion MQTT, cache, hub SSE, HTTP.
 *
 * ARCHITECTURE : thread MQTT bloquant -> cache + hub (tâche tokio) -> clients SSE.
 * Le thread d'ingestion ne touche jamais directement aux clients, tout passe
 * par le canal du hub.
 */

mod config;
mod health;
mod http;
mod hub;
mod ingest;

use crate::config::CollectorConfig;
use crate::health::BrokerHealth;
use crate::http::AppState;
use crate::ingest::{spawn_ingest_thread, IngestRouter};
use anyhow::{Context, Result};
use kelo_core::LatestCache;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    kelo_core::logging::init("info,kelo_collector=info,kelo_core=info")?;

    let config = CollectorConfig::from_env().context("invalid collector configuration")?;
    info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        topic = %config.topic,
        "KELO collector starting"
    );

    let cache = Arc::new(LatestCache::new());
    let hub = hub::spawn_hub(cache.clone(), config.keep_alive, config.client_buffer);
    let health = BrokerHealth::new();

    let router = IngestRouter::new(cache.clone(), hub.clone());
    spawn_ingest_thread(
        &config.broker,
        config.topic.clone(),
        config.retry_delay,
        router,
        health.clone(),
    )
    .context("failed to start MQTT ingest thread")?;

    let app = http::build_router(AppState { cache, hub, health });
    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    info!(bind = %config.http_bind, "collector HTTP listening");

    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "HTTP server stopped");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = http_handle => {}
    }

    Ok(())
}
