//! Environment-style configuration helpers.
//!
//! Every parser takes a lookup function instead of reading `std::env`
//! directly, so tests can feed a plain map.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

/// Broker connection settings shared by the simulator and the collector.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl BrokerConfig {
    pub fn from_lookup<F>(lookup: &F, default_client_id: String) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = env_string(lookup, "MQTT_BROKER", Some("mosquitto".to_string()))?;
        let port = u16::try_from(env_u64(lookup, "MQTT_PORT", Some(1883))?)
            .context("invalid MQTT_PORT")?;
        let client_id = env_string(lookup, "MQTT_CLIENT_ID", Some(default_client_id))?;
        let keep_alive = Duration::from_secs(env_u64(lookup, "MQTT_KEEP_ALIVE", Some(60))?);
        if keep_alive.is_zero() {
            return Err(anyhow!("MQTT_KEEP_ALIVE must be at least 1 second"));
        }

        Ok(Self {
            host,
            port,
            client_id,
            keep_alive,
        })
    }
}

/// Reads the real process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

pub fn env_string<F>(lookup: &F, key: &str, default: Option<String>) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match env_optional(lookup, key) {
        Some(value) => Ok(value),
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

pub fn env_u64<F>(lookup: &F, key: &str, default: Option<u64>) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match env_optional(lookup, key) {
        Some(value) => value.parse::<u64>().with_context(|| format!("invalid {key}")),
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

/// Seconds, fractional values allowed (`PUBLISH_INTERVAL=0.5`).
pub fn env_secs<F>(lookup: &F, key: &str, default: Option<f64>) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = match env_optional(lookup, key) {
        Some(value) => value.parse::<f64>().with_context(|| format!("invalid {key}"))?,
        None => default.ok_or_else(|| anyhow!("missing env var {key}"))?,
    };
    Duration::try_from_secs_f64(secs).with_context(|| format!("invalid {key}: {secs}"))
}

/// Comma-separated list; blank items are skipped.
pub fn env_list<F>(lookup: &F, key: &str, default: &[&str]) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    match env_optional(lookup, key) {
        Some(raw) => raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        None => default.iter().map(|item| item.to_string()).collect(),
    }
}

pub fn env_optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
