//! Simulator configuration from environment variables
//!
//! Handles:
//! - MQTT broker settings
//! - Publish topic template and simulated node ids
//! - Publish cadence and reconnect policy
//! - HTTP bind address

use anyhow::{anyhow, Result};
use kelo_core::config::{env_list, env_secs, env_string, env_u64, process_env, BrokerConfig};
use kelo_core::topic::{TopicTemplate, DEFAULT_TELEMETRY_TOPIC};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub broker: BrokerConfig,
    pub topic: TopicTemplate,
    pub nodes: Vec<String>,
    pub publish_interval: Duration,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub http_bind: String,
}

impl SimulatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_client_id = format!("kelo-simulateur-{}", uuid::Uuid::new_v4().simple());
        let broker = BrokerConfig::from_lookup(lookup, default_client_id)?;

        let topic = TopicTemplate::parse(&env_string(
            lookup,
            "MQTT_TOPIC",
            Some(DEFAULT_TELEMETRY_TOPIC.to_string()),
        )?);

        let nodes = env_list(lookup, "SIMULATEUR_NIDS", &["A12"]);
        if nodes.is_empty() {
            return Err(anyhow!("SIMULATEUR_NIDS must list at least one node id"));
        }

        let publish_interval = env_secs(lookup, "PUBLISH_INTERVAL", Some(5.0))?;
        if publish_interval.is_zero() {
            return Err(anyhow!("PUBLISH_INTERVAL must be greater than zero"));
        }
        let retry_delay = env_secs(lookup, "MQTT_RETRY_DELAY", Some(5.0))?;
        let connect_timeout = env_secs(lookup, "MQTT_CONNECT_TIMEOUT", Some(5.0))?;

        let host = env_string(lookup, "SIMULATEUR_HOST", Some("0.0.0.0".to_string()))?;
        let port = env_u64(lookup, "SIMULATEUR_PORT", Some(5000))?;

        Ok(Self {
            broker,
            topic,
            nodes,
            publish_interval,
            retry_delay,
            connect_timeout,
            http_bind: format!("{host}:{port}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<SimulatorConfig> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        SimulatorConfig::from_lookup(&|key: &str| map.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.broker.port, 1883);
        assert!(config.broker.client_id.starts_with("kelo-simulateur-"));
        assert_eq!(config.topic.for_node("A12"), "kelo/nid/A12/telemetry");
        assert_eq!(config.nodes, vec!["A12"]);
        assert_eq!(config.publish_interval, Duration::from_secs(5));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.http_bind, "0.0.0.0:5000");
    }

    #[test]
    fn test_multi_node_overrides() {
        let config = config_from(&[
            ("SIMULATEUR_NIDS", "A12,B7"),
            ("PUBLISH_INTERVAL", "2.5"),
            ("MQTT_TOPIC", "kelo/nid/A12/telemetry"),
            ("SIMULATEUR_PORT", "5050"),
        ])
        .unwrap();
        assert_eq!(config.nodes, vec!["A12", "B7"]);
        assert_eq!(config.publish_interval, Duration::from_millis(2500));
        assert_eq!(config.topic, TopicTemplate::Fixed("kelo/nid/A12/telemetry".into()));
        assert_eq!(config.http_bind, "0.0.0.0:5050");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config_from(&[("PUBLISH_INTERVAL", "0")]).is_err());
        assert!(config_from(&[("PUBLISH_INTERVAL", "often")]).is_err());
        assert!(config_from(&[("SIMULATEUR_NIDS", " , ")]).is_err());
        assert!(config_from(&[("SIMULATEUR_PORT", "http")]).is_err());
    }
}
