use crate::hub::MAX_CLIENT_BUFFER;
use anyhow::{anyhow, Context, Result};
use kelo_core::config::{env_secs, env_string, env_u64, process_env, BrokerConfig};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub broker: BrokerConfig,
    pub topic: String,
    pub retry_delay: Duration,
    pub keep_alive: Duration,
    pub client_buffer: usize,
    pub http_bind: String,
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_client_id = format!("kelo-collector-{}", uuid::Uuid::new_v4().simple());
        let broker = BrokerConfig::from_lookup(lookup, default_client_id)?;
        let topic = env_string(lookup, "MQTT_TOPIC", Some("kelo/#".to_string()))?;
        let retry_delay = env_secs(lookup, "MQTT_RETRY_DELAY", Some(2.0))?;

        let keep_alive = env_secs(lookup, "COLLECTOR_KEEPALIVE", Some(15.0))?;
        if keep_alive.is_zero() {
            return Err(anyhow!("COLLECTOR_KEEPALIVE must be greater than zero"));
        }
        let client_buffer = usize::try_from(env_u64(lookup, "COLLECTOR_CLIENT_BUFFER", Some(32))?)
            .context("invalid COLLECTOR_CLIENT_BUFFER")?;
        if !(1..=MAX_CLIENT_BUFFER).contains(&client_buffer) {
            return Err(anyhow!(
                "COLLECTOR_CLIENT_BUFFER must be between 1 and {MAX_CLIENT_BUFFER}"
            ));
        }

        let host = env_string(lookup, "COLLECTOR_HOST", Some("0.0.0.0".to_string()))?;
        let port = env_u64(lookup, "COLLECTOR_PORT", Some(8081))?;

        Ok(Self {
            broker,
            topic,
            retry_delay,
            keep_alive,
            client_buffer,
            http_bind: format!("{host}:{port}"),
        })
    }
}
