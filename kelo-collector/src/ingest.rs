/**
 * INGESTION MQTT - Réception des messages broker côté collecteur
 *
 * RÔLE :
 * Décode chaque message reçu sur le topic d'ingestion, met à jour le cache
 * "dernière valeur" et transmet l'échantillon au hub de diffusion.
 *
 * FONCTIONNEMENT :
 * - Thread OS dédié qui pilote la connexion MQTT bloquante (rumqttc::Client)
 * - Réabonnement au topic à chaque ConnAck
 * - Payload invalide : ignoré silencieusement, aucune mise à jour partielle
 * - Passage au hub via HubHandle (canal thread-safe, jamais d'appel direct)
 */

use crate::health::BrokerHealth;
use crate::hub::HubHandle;
use kelo_core::config::BrokerConfig;
use kelo_core::{LatestCache, TelemetrySample};
use rumqttc::{Client, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone)]
pub struct IngestRouter {
    cache: Arc<LatestCache>,
    hub: HubHandle,
}

impl IngestRouter {
    pub fn new(cache: Arc<LatestCache>, hub: HubHandle) -> Self {
        Self { cache, hub }
    }

    /// Handles one broker message. Returns the node id on success.
    pub fn handle_payload(&self, payload: &[u8]) -> Option<String> {
        let sample = match TelemetrySample::from_payload(payload) {
            Ok(sample) => sample,
            Err(err) => {
                tracing::trace!(error = %err, "ignoring malformed telemetry payload");
                return None;
            }
        };

        let node_id = sample.node_id.clone();
        self.cache.put(sample.clone());
        self.hub.publish(sample);
        Some(node_id)
    }
}

/// Runs the blocking MQTT loop on its own thread.
pub fn spawn_ingest_thread(
    broker: &BrokerConfig,
    topic: String,
    retry_delay: Duration,
    router: IngestRouter,
    health: BrokerHealth,
) -> std::io::Result<JoinHandle<()>> {
    let mut opts = MqttOptions::new(broker.client_id.clone(), broker.host.clone(), broker.port);
    opts.set_keep_alive(broker.keep_alive);
    opts.set_clean_session(true);
    let address = format!("{}:{}", broker.host, broker.port);

    thread::Builder::new()
        .name("mqtt-ingest".to_string())
        .spawn(move || run_ingest_loop(opts, address, topic, retry_delay, router, health))
}

fn run_ingest_loop(
    opts: MqttOptions,
    address: String,
    topic: String,
    retry_delay: Duration,
    router: IngestRouter,
    health: BrokerHealth,
) {
    let (client, mut connection) = Client::new(opts, 10);
    tracing::info!(broker = %address, %topic, "MQTT ingest thread started");

    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    health.mark_connected();
                    tracing::info!(broker = %address, "connected, subscribing to {topic}");
                    if let Err(err) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                        tracing::error!(error = %err, "subscribe MQTT failed");
                    }
                } else {
                    health.mark_disconnected();
                    tracing::warn!(code = ?ack.code, "MQTT broker refused connection");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                router.handle_payload(&publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                health.mark_disconnected();
                tracing::warn!("disconnected by MQTT broker");
            }
            Ok(_) => {}
            Err(err) => {
                health.increment_reconnects();
                tracing::warn!(error = %err, retry_in = ?retry_delay, "MQTT ingest connection error");
                thread::sleep(retry_delay);
            }
        }
    }

    health.mark_disconnected();
    tracing::warn!("MQTT ingest loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{spawn_hub, Frame};
    use kelo_core::SampleGenerator;

    fn router() -> (IngestRouter, Arc<LatestCache>, HubHandle) {
        let cache = Arc::new(LatestCache::new());
        let hub = spawn_hub(cache.clone(), Duration::from_secs(15), 8);
        (IngestRouter::new(cache.clone(), hub.clone()), cache, hub)
    }

    #[tokio::test]
    async fn test_valid_payload_updates_cache_and_hub() {
        let (router, cache, hub) = router();
        let mut sub = hub.subscribe().await.unwrap();

        let sample = SampleGenerator::seeded(4).generate("A12");
        let payload = sample.to_payload().unwrap();
        assert_eq!(router.handle_payload(&payload).as_deref(), Some("A12"));

        assert_eq!(cache.get(), Some(sample.clone()));
        assert_eq!(sub.next_frame().await, Some(Frame::Sample(sample)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_payload_changes_nothing() {
        let (router, cache, hub) = router();
        let previous = SampleGenerator::seeded(8).generate("A12");
        cache.put(previous.clone());

        let mut sub = hub.subscribe().await.unwrap();
        assert_eq!(sub.next_frame().await, Some(Frame::Sample(previous.clone())));

        assert!(router.handle_payload(b"{\"nid\": \"A12\", \"temperature\": ").is_none());
        assert!(router.handle_payload(&[0xc3, 0x28]).is_none());
        assert!(router.handle_payload(br#"{"nid":"B7","temperature":"hot"}"#).is_none());

        assert_eq!(cache.get(), Some(previous));
        assert_eq!(cache.node_count(), 1);
        // nothing was broadcast: the next frame is the idle keep-alive
        assert_eq!(sub.next_frame().await, Some(Frame::KeepAlive));
        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_nid_is_stored_as_unknown() {
        let (router, cache, _hub) = router();
        let payload = br#"{"temperature":24.5,"humidite":80,"vibration":3.9,"tension":1.2,"horodatage":"2024-05-01T12:00:00Z"}"#;
        assert_eq!(router.handle_payload(payload).as_deref(), Some("unknown"));
        assert_eq!(cache.get_node("unknown").unwrap().temperature, 24.5);
    }
}
