//! Simulator HTTP API
//!
//! - `GET /data[?nid=]` : fresh sample for a node (first configured node by default)
//! - `GET /health`      : liveness check
//! - `GET /status`      : broker link state + last generated sample
//!
//! Unknown routes answer a JSON 404.

use crate::publisher::LinkStatus;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use kelo_core::{LatestCache, SampleGenerator};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<SampleGenerator>,
    pub snapshot: Arc<LatestCache>,
    pub nodes: Arc<Vec<String>>,
    pub link: LinkStatus,
}

#[derive(Debug, Deserialize)]
struct DataParams {
    nid: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/data", get(get_data))
        .route("/health", get(health))
        .route("/status", get(get_status))
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

// GET /data
async fn get_data(
    State(app): State<AppState>,
    Query(params): Query<DataParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let nid = params
        .nid
        .filter(|nid| !nid.trim().is_empty())
        .or_else(|| app.nodes.first().cloned())
        .unwrap_or_else(|| kelo_core::sample::UNKNOWN_NODE.to_string());

    let sample = app.generator.generate(&nid);
    match serde_json::to_value(&sample) {
        Ok(body) => {
            tracing::info!(
                nid = %sample.node_id,
                temperature = sample.temperature,
                humidite = sample.humidity,
                "sample served"
            );
            Ok(Json(body))
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to generate sample");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to generate telemetry sample" })),
            ))
        }
    }
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Route non trouvée" })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// GET /status
async fn get_status(State(app): State<AppState>) -> Json<Value> {
    let latest = match app.snapshot.entry(None) {
        Some(entry) => serde_json::to_value(entry).unwrap_or_else(|_| json!({})),
        None => json!({}),
    };
    Json(json!({
        "connection": app.link.state(),
        "nodes": app.nodes.as_slice(),
        "latest": latest,
    }))
}
