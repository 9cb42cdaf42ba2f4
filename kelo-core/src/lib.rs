/*!
# KELO Core - Briques partagées du relais de télémétrie

Bibliothèque commune au simulateur et au collecteur :
- Modèle `TelemetrySample` et format fil MQTT (JSON)
- Générateur d'échantillons synthétiques
- Cache "dernière valeur" par nœud
- Suivi d'état de connexion + abstraction de transport broker
- Stub MQTT en mémoire pour les tests sans broker
*/

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod mqtt_stub;
pub mod sample;
pub mod topic;

pub use broker::{ConnectionState, ConnectionTracker, Link, MqttTransport, Transport};
pub use cache::{LatestCache, LatestEntry};
pub use error::TelemetryError;
pub use mqtt_stub::MockTransport;
pub use sample::{SampleGenerator, TelemetrySample};
pub use topic::TopicTemplate;
