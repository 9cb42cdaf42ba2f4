//! KELO Simulator - Simulated IoT sensor nodes
//!
//! Each tick, every configured node produces one synthetic reading that is
//! published to the MQTT broker. The same readings can be pulled over HTTP:
//! - Periodic publish with reconnect policy (`publisher`)
//! - `GET /data`, `GET /health`, `GET /status` (`http`)

mod config;
mod http;
mod publisher;

use anyhow::{Context, Result};
use config::SimulatorConfig;
use kelo_core::{LatestCache, MqttTransport, SampleGenerator};
use publisher::{Publisher, ReconnectPolicy};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    kelo_core::logging::init("info,kelo_simulator=info,kelo_core=info")?;

    let config = SimulatorConfig::from_env().context("invalid simulator configuration")?;
    info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        nodes = ?config.nodes,
        "KELO simulator starting"
    );

    // snapshot local pour /status, distinct du cache du collecteur
    let snapshot = Arc::new(LatestCache::new());
    let generator = Arc::new(SampleGenerator::new().with_snapshot(snapshot.clone()));

    let publisher = Arc::new(
        Publisher::new(
            MqttTransport::new(config.broker.clone()),
            generator.clone(),
            config.topic.clone(),
            config.nodes.clone(),
        )
        .with_interval(config.publish_interval)
        .with_policy(ReconnectPolicy::constant(
            config.retry_delay,
            config.connect_timeout,
        )),
    );
    let link = publisher.status();
    let publish_handle = publisher.spawn();

    let app = http::build_router(http::AppState {
        generator,
        snapshot,
        nodes: Arc::new(config.nodes.clone()),
        link,
    });
    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    info!(bind = %config.http_bind, "simulator HTTP listening");
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "HTTP server stopped");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = publish_handle => {
            error!("publisher task exited");
        }
        _ = http_handle => {}
    }

    Ok(())
}
