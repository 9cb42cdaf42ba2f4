//! Broker connection seam.
//!
//! `Transport` opens a fresh connection and returns a `Link` used to publish.
//! The connection state is never guessed by the caller: the transport's own
//! event loop drives a [`ConnectionTracker`] from ConnAck / error / Disconnect
//! events, and callers wait on it with a bounded timeout.

use crate::config::BrokerConfig;
use crate::error::TelemetryError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Connection state shared between the publishing side and the broker
/// client's event loop (which may run on another thread).
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Waits until the state leaves `Connecting`. Succeeds only on `Connected`.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), TelemetryError> {
        let mut rx = self.tx.subscribe();
        let outcome = tokio::time::timeout(
            limit,
            rx.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;

        match outcome {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(TelemetryError::Connect(
                "connection closed before ConnAck".to_string(),
            )),
            Err(_) => Err(TelemetryError::ConnectTimeout(limit)),
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    /// Starts a new connection. The returned link is usable once `tracker`
    /// reports `Connected`.
    async fn connect(&self, tracker: ConnectionTracker) -> Result<Self::Link, TelemetryError>;
}

/// A single broker connection. Dropped (and closed) on the first failure.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TelemetryError>;

    fn close(&self);
}

/// How long a closing link may take to flush DISCONNECT before its poller is aborted.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// rumqttc-backed transport. One `AsyncClient` + event loop task per link.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    config: BrokerConfig,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        opts.set_keep_alive(self.config.keep_alive);
        opts.set_clean_session(true);
        opts
    }
}

pub struct MqttLink {
    client: AsyncClient,
    poller: JoinHandle<()>,
    closing: AtomicBool,
}

#[async_trait]
impl Transport for MqttTransport {
    type Link = MqttLink;

    async fn connect(&self, tracker: ConnectionTracker) -> Result<MqttLink, TelemetryError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        let broker = format!("{}:{}", self.config.host, self.config.port);

        // rumqttc would silently reconnect on the next poll; the link is
        // single-use instead, so the poller stops at the first failure.
        let poller = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            tracing::info!(%broker, "connected to MQTT broker");
                            tracker.set(ConnectionState::Connected);
                        } else {
                            tracing::warn!(%broker, code = ?ack.code, "MQTT broker refused connection");
                            tracker.set(ConnectionState::Disconnected);
                            return;
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        // already flushed to the socket
                        tracing::debug!(%broker, "MQTT disconnect sent");
                        tracker.set(ConnectionState::Disconnected);
                        return;
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        tracing::warn!(%broker, "disconnected by MQTT broker");
                        tracker.set(ConnectionState::Disconnected);
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(%broker, error = %err, "MQTT connection error");
                        tracker.set(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        });

        Ok(MqttLink {
            client,
            poller,
            closing: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TelemetryError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|err| TelemetryError::Publish(err.to_string()))
    }

    /// Queues DISCONNECT; the poller stops once it is written, or after
    /// [`DISCONNECT_GRACE`] if the broker never got that far.
    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.client.try_disconnect() {
            tracing::debug!(error = %err, "MQTT disconnect not queued");
            self.poller.abort();
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let poller = self.poller.abort_handle();
                runtime.spawn(async move {
                    tokio::time::sleep(DISCONNECT_GRACE).await;
                    poller.abort();
                });
            }
            Err(_) => self.poller.abort(),
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if !self.closing.load(Ordering::Acquire) {
            self.poller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_times_out_without_ack() {
        let tracker = ConnectionTracker::new();
        tracker.set(ConnectionState::Connecting);
        let err = tracker.wait_connected(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TelemetryError::ConnectTimeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_wakes_on_ack() {
        let tracker = ConnectionTracker::new();
        tracker.set(ConnectionState::Connecting);

        let acker = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            acker.set(ConnectionState::Connected);
        });

        tracker.wait_connected(Duration::from_secs(5)).await.unwrap();
        assert_eq!(tracker.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_wait_connected_fails_fast_on_disconnect() {
        let tracker = ConnectionTracker::new();
        tracker.set(ConnectionState::Connecting);
        tracker.set(ConnectionState::Disconnected);
        let err = tracker.wait_connected(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Connect(_)));
    }

    async fn read_packet(socket: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = socket.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.unwrap();
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        socket.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn test_close_sends_disconnect_to_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = MqttTransport::new(BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            client_id: "kelo-close-test".to_string(),
            keep_alive: Duration::from_secs(60),
        });
        let tracker = ConnectionTracker::new();
        tracker.set(ConnectionState::Connecting);
        let link = transport.connect(tracker.clone()).await.unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        let (connect, _) = read_packet(&mut socket).await;
        assert_eq!(connect, 0x10);
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        tracker.wait_connected(Duration::from_secs(5)).await.unwrap();

        link.close();
        let (packet, body) = tokio::time::timeout(Duration::from_secs(2), read_packet(&mut socket))
            .await
            .unwrap();
        assert_eq!(packet, 0xe0);
        assert!(body.is_empty());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ConnectionState::Connected).unwrap(),
            serde_json::json!("connected")
        );
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
