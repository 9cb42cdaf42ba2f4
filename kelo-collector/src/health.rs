use kelo_core::{ConnectionState, LatestCache};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct CollectorHealth {
    pub uptime_seconds: u64,
    pub nodes_tracked: u32,
    pub subscribers: u32,
    pub mqtt_status: ConnectionState,
    pub mqtt_reconnects: u32,
}

/// Broker connectivity as seen by the ingest thread.
#[derive(Clone)]
pub struct BrokerHealth {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<ConnectionState>>,
}

impl BrokerHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new(ConnectionState::Connecting)),
        }
    }

    pub fn mark_connected(&self) {
        *self.mqtt_status.lock() = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&self) {
        *self.mqtt_status.lock() = ConnectionState::Disconnected;
    }

    /// Connection error: rumqttc reconnects on the next poll.
    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = ConnectionState::Connecting;
    }

    pub fn status(&self) -> ConnectionState {
        *self.mqtt_status.lock()
    }

    pub fn get_health(&self, cache: &LatestCache, subscribers: usize) -> CollectorHealth {
        CollectorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_tracked: cache.node_count() as u32,
            subscribers: subscribers as u32,
            mqtt_status: self.status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for BrokerHealth {
    fn default() -> Self {
        Self::new()
    }
}
