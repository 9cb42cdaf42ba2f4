//! Telemetry publisher with reconnect policy
//!
//! One broker connection per simulator process, shared by every simulated
//! node. The publish cadence never depends on connection health:
//! - each tick generates one sample per node and tries to publish it
//! - any failure discards the connection; the next publish reconnects
//! - failed connection attempts are spaced by the policy's retry delay
//! - failures are logged and the sample is dropped (at-most-once)

use kelo_core::{
    ConnectionState, ConnectionTracker, Link, SampleGenerator, TelemetryError, TelemetrySample,
    TopicTemplate, Transport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Reconnect policy: constant delay between failed attempts, no attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl ReconnectPolicy {
    pub fn constant(retry_delay: Duration, connect_timeout: Duration) -> Self {
        Self {
            retry_delay,
            connect_timeout,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_after(&self, _failures: u32) -> Duration {
        self.retry_delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::constant(Duration::from_secs(5), Duration::from_secs(5))
    }
}

/// Cloneable view of the publisher's connection state, for status endpoints.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    current: Arc<Mutex<ConnectionTracker>>,
}

impl LinkStatus {
    pub fn state(&self) -> ConnectionState {
        self.current.lock().current()
    }

    // Each attempt gets its own tracker so a stale event loop can never flip
    // the state of a newer connection.
    fn begin_attempt(&self) -> ConnectionTracker {
        let tracker = ConnectionTracker::new();
        tracker.set(ConnectionState::Connecting);
        *self.current.lock() = tracker.clone();
        tracker
    }
}

struct Session<L> {
    link: Arc<L>,
    tracker: ConnectionTracker,
}

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    pub failed: usize,
}

pub struct Publisher<T: Transport> {
    transport: T,
    generator: Arc<SampleGenerator>,
    topic: TopicTemplate,
    nodes: Vec<String>,
    interval: Duration,
    policy: ReconnectPolicy,
    session: Mutex<Option<Session<T::Link>>>,
    backoff: Mutex<Backoff>,
    status: LinkStatus,
}

impl<T: Transport> Publisher<T> {
    pub fn new(
        transport: T,
        generator: Arc<SampleGenerator>,
        topic: TopicTemplate,
        nodes: Vec<String>,
    ) -> Self {
        Self {
            transport,
            generator,
            topic,
            nodes,
            interval: Duration::from_secs(5),
            policy: ReconnectPolicy::default(),
            session: Mutex::new(None),
            backoff: Mutex::new(Backoff::default()),
            status: LinkStatus::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn status(&self) -> LinkStatus {
        self.status.clone()
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Fixed-period loop; never returns.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            nodes = ?self.nodes,
            topic = %self.topic,
            interval = ?self.interval,
            "starting telemetry publisher"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One sample per configured node, all on the shared connection.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for node_id in &self.nodes {
            let sample = self.generator.generate(node_id);
            match self.publish_sample(&sample).await {
                Ok(topic) => {
                    report.published += 1;
                    tracing::info!(
                        %topic,
                        nid = %node_id,
                        temperature = sample.temperature,
                        humidite = sample.humidity,
                        "telemetry published"
                    );
                }
                Err(TelemetryError::Backoff(wait)) => {
                    report.failed += 1;
                    tracing::debug!(nid = %node_id, ?wait, "broker unavailable, sample dropped");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(nid = %node_id, error = %err, "telemetry publish failed");
                }
            }
        }
        report
    }

    /// Publishes one sample, reconnecting first if needed. Returns the topic.
    pub async fn publish_sample(&self, sample: &TelemetrySample) -> Result<String, TelemetryError> {
        let topic = self.topic.for_node(&sample.node_id);
        let payload = sample.to_payload()?;
        let link = self.ensure_connected().await?;

        if let Err(err) = link.publish(&topic, payload).await {
            self.discard();
            return Err(err);
        }
        Ok(topic)
    }

    async fn ensure_connected(&self) -> Result<Arc<T::Link>, TelemetryError> {
        {
            let mut session = self.session.lock();
            if let Some(current) = session.as_ref() {
                if current.tracker.current() == ConnectionState::Connected {
                    return Ok(current.link.clone());
                }
            }
            if let Some(stale) = session.take() {
                tracing::warn!("broker link lost, discarding connection");
                stale.link.close();
            }
        }

        if let Some(wait) = self.backoff_remaining() {
            return Err(TelemetryError::Backoff(wait));
        }

        let tracker = self.status.begin_attempt();
        tracing::info!("connecting to MQTT broker");

        let link = match self.transport.connect(tracker.clone()).await {
            Ok(link) => link,
            Err(err) => {
                tracker.set(ConnectionState::Disconnected);
                self.record_failure();
                return Err(err);
            }
        };

        if let Err(err) = tracker.wait_connected(self.policy.connect_timeout).await {
            link.close();
            tracker.set(ConnectionState::Disconnected);
            self.record_failure();
            return Err(err);
        }

        let link = Arc::new(link);
        *self.backoff.lock() = Backoff::default();
        *self.session.lock() = Some(Session {
            link: link.clone(),
            tracker,
        });
        Ok(link)
    }

    fn discard(&self) {
        if let Some(session) = self.session.lock().take() {
            session.link.close();
            session.tracker.set(ConnectionState::Disconnected);
        }
    }

    fn record_failure(&self) {
        let mut backoff = self.backoff.lock();
        backoff.failures = backoff.failures.saturating_add(1);
        let delay = self.policy.delay_after(backoff.failures);
        backoff.retry_at = Some(Instant::now() + delay);
        tracing::warn!(
            failures = backoff.failures,
            retry_in = ?delay,
            "MQTT connection attempt failed"
        );
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let retry_at = self.backoff.lock().retry_at?;
        let now = Instant::now();
        (retry_at > now).then(|| retry_at - now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kelo_core::mqtt_stub::ConnectOutcome;
    use kelo_core::MockTransport;

    fn publisher(transport: &MockTransport, nodes: &[&str]) -> Publisher<MockTransport> {
        Publisher::new(
            transport.clone(),
            Arc::new(SampleGenerator::seeded(42)),
            TopicTemplate::default(),
            nodes.iter().map(|n| n.to_string()).collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_shares_one_connection_across_nodes() {
        let transport = MockTransport::new();
        let publisher = publisher(&transport, &["A12", "B7"]);

        let report = publisher.tick().await;
        assert_eq!(report, TickReport { published: 2, failed: 0 });
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(publisher.status().state(), ConnectionState::Connected);

        let topics: Vec<String> = transport.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["kelo/nid/A12/telemetry", "kelo/nid/B7/telemetry"]);

        let sample: TelemetrySample = transport
            .last_json_message("kelo/nid/B7/telemetry")
            .unwrap()
            .unwrap();
        assert_eq!(sample.node_id, "B7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_then_reconnect_resumes() {
        let transport = MockTransport::new();
        let publisher = publisher(&transport, &["A12"]);

        assert_eq!(publisher.tick().await.published, 1);

        transport.fail_next_publishes(1);
        let report = publisher.tick().await;
        assert_eq!(report, TickReport { published: 0, failed: 1 });
        assert_eq!(publisher.status().state(), ConnectionState::Disconnected);

        // A publish error is not a failed connection attempt: no back-off.
        assert_eq!(publisher.tick().await.published, 1);
        assert_eq!(transport.connect_attempts(), 2);
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_on_one_node_reconnects_before_next_node() {
        let transport = MockTransport::new();
        let publisher = publisher(&transport, &["A12", "B7"]);

        transport.fail_next_publishes(1);
        let report = publisher.tick().await;

        assert_eq!(report, TickReport { published: 1, failed: 1 });
        assert_eq!(transport.connect_attempts(), 2);
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "kelo/nid/B7/telemetry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_waits_retry_delay() {
        let transport = MockTransport::new();
        transport.script_connects(&[ConnectOutcome::Refuse]);
        let publisher = publisher(&transport, &["A12"]);

        assert_eq!(publisher.tick().await.failed, 1);
        assert_eq!(transport.connect_attempts(), 1);

        // Still inside the retry delay: sample dropped, no new attempt.
        assert_eq!(publisher.tick().await.failed, 1);
        assert_eq!(transport.connect_attempts(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(publisher.tick().await.published, 1);
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_connack_times_out() {
        let transport = MockTransport::new();
        transport.script_connects(&[ConnectOutcome::Silent]);
        let publisher = publisher(&transport, &["A12"]);

        let started = Instant::now();
        let sample = SampleGenerator::seeded(1).generate("A12");
        let err = publisher.publish_sample(&sample).await.unwrap_err();

        assert!(matches!(err, TelemetryError::ConnectTimeout(_)));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(publisher.status().state(), ConnectionState::Disconnected);
        assert!(transport.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_disconnect_forces_reconnect() {
        let transport = MockTransport::new();
        let publisher = publisher(&transport, &["A12"]);

        publisher.tick().await;
        transport.drop_connection();
        assert_eq!(publisher.status().state(), ConnectionState::Disconnected);

        assert_eq!(publisher.tick().await.published, 1);
        assert_eq!(transport.connect_attempts(), 2);
        assert_eq!(publisher.status().state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_holds_while_broker_is_down() {
        let transport = MockTransport::new();
        transport.script_connects(&[ConnectOutcome::Refuse, ConnectOutcome::Refuse]);
        let publisher = Arc::new(publisher(&transport, &["A12"]));

        let handle = publisher.clone().spawn();
        // Ticks at 0, 5, 10, 15 and 20 s; the first two connection attempts fail.
        tokio::time::sleep(Duration::from_secs(21)).await;
        handle.abort();

        assert_eq!(transport.connect_attempts(), 3);
        assert_eq!(transport.published().len(), 3);
    }
}
