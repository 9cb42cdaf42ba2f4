use std::time::Duration;
use thiserror::Error;

/// Failures of the relay core. None of them is fatal: callers log and move on.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("no ConnAck from broker within {0:?}")]
    ConnectTimeout(Duration),

    #[error("reconnect attempt deferred for another {0:?}")]
    Backoff(Duration),

    #[error("publish rejected: {0}")]
    Publish(String),

    #[error("broker link is not connected")]
    Disconnected,

    #[error("failed to encode telemetry sample: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid telemetry payload: {0}")]
    Decode(#[source] serde_json::Error),
}
