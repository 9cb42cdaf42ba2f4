/*!
Transport MQTT simulé pour développer et tester sans broker

Enregistre tous les messages publiés, rejoue un script de résultats de
connexion (accepté / refusé / silencieux) et permet d'injecter des échecs de
publication ou des déconnexions asynchrones.
*/

use crate::broker::{ConnectionState, ConnectionTracker, Link, Transport};
use crate::error::TelemetryError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What the simulated broker does with the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// ConnAck immediately.
    Accept,
    /// Connection error before any ConnAck.
    Refuse,
    /// TCP accepted but no ConnAck ever arrives.
    Silent,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<ConnectOutcome>,
    published: Vec<MockMessage>,
    connects: usize,
    failing_publishes: usize,
    live: Option<ConnectionTracker>,
}

/// Mock transport; clones share the same recorded state.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for the next connection attempts. Once the script is
    /// exhausted every attempt is accepted.
    pub fn script_connects(&self, outcomes: &[ConnectOutcome]) {
        self.state.lock().script.extend(outcomes.iter().copied());
    }

    /// The next `count` publishes are rejected.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failing_publishes += count;
    }

    /// Simulates an asynchronous Disconnect notification on the live link.
    pub fn drop_connection(&self) {
        if let Some(tracker) = self.state.lock().live.take() {
            tracker.set(ConnectionState::Disconnected);
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connects
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.state.lock().published.clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last payload published on `topic`.
    pub fn last_json_message<T>(&self, topic: &str) -> Result<Option<T>, serde_json::Error>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => serde_json::from_slice(&msg.payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.state.lock().published.clear();
    }
}

pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    tracker: ConnectionTracker,
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn connect(&self, tracker: ConnectionTracker) -> Result<MockLink, TelemetryError> {
        let outcome = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.script.pop_front().unwrap_or(ConnectOutcome::Accept)
        };

        match outcome {
            ConnectOutcome::Refuse => {
                tracker.set(ConnectionState::Disconnected);
                Err(TelemetryError::Connect("connection refused".to_string()))
            }
            ConnectOutcome::Accept => {
                tracker.set(ConnectionState::Connected);
                self.state.lock().live = Some(tracker.clone());
                Ok(MockLink {
                    state: self.state.clone(),
                    tracker,
                })
            }
            ConnectOutcome::Silent => Ok(MockLink {
                state: self.state.clone(),
                tracker,
            }),
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TelemetryError> {
        if self.tracker.current() != ConnectionState::Connected {
            return Err(TelemetryError::Disconnected);
        }

        let mut state = self.state.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(TelemetryError::Publish("injected failure".to_string()));
        }

        tracing::debug!(topic, bytes = payload.len(), "[mock] published");
        state.published.push(MockMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn close(&self) {
        self.tracker.set(ConnectionState::Disconnected);
    }
}
