/**
 * API HTTP COLLECTEUR - Flux SSE et dernière valeur
 *
 * ROUTES :
 * - GET /collector/events  : flux text/event-stream (data + keep-alive)
 * - GET /collector/latest  : dernière valeur {nid, data} ou {} (option ?nid=)
 * - GET /collector/status  : état broker, abonnés, nœuds suivis
 * - GET /health            : liveness
 * - toute autre route      : 404 JSON {"error": ...}
 *
 * La déconnexion d'un client SSE détruit le flux, donc la Subscription,
 * ce qui désabonne le client du hub.
 */

use crate::health::{BrokerHealth, CollectorHealth};
use crate::hub::{Frame, HubHandle};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use kelo_core::LatestCache;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<LatestCache>,
    pub hub: HubHandle,
    pub health: BrokerHealth,
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    nid: Option<String>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/collector/events", get(events))
        .route("/collector/latest", get(latest))
        .route("/collector/status", get(status))
        .fallback(not_found)
        .with_state(app_state)
        .layer(CorsLayer::permissive())
}

// GET /collector/events
async fn events(
    State(app): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let Some(subscription) = app.hub.subscribe().await else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "broadcast hub unavailable" })),
        ));
    };
    tracing::info!(subscriber = subscription.id(), "SSE client connected");

    let stream = subscription
        .into_stream()
        .filter_map(|frame| futures::future::ready(frame_to_event(frame).map(Ok)));
    Ok(Sse::new(stream))
}

fn frame_to_event(frame: Frame) -> Option<Event> {
    match frame {
        Frame::Sample(sample) => match Event::default().json_data(&sample) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!(nid = %sample.node_id, error = %err, "failed to encode SSE frame");
                None
            }
        },
        Frame::KeepAlive => Some(Event::default().comment("keep-alive")),
    }
}

// GET /collector/latest
async fn latest(State(app): State<AppState>, Query(params): Query<LatestParams>) -> Json<Value> {
    let entry = app.cache.entry(params.nid.as_deref());
    let body = entry
        .and_then(|entry| serde_json::to_value(entry).ok())
        .unwrap_or_else(|| json!({}));
    Json(body)
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Route non trouvée" })))
}

// GET /collector/status
async fn status(State(app): State<AppState>) -> Json<CollectorHealth> {
    let subscribers = app.hub.subscriber_count().await;
    Json(app.health.get_health(&app.cache, subscribers))
}
