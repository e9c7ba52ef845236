use serde::Deserialize;
use std::fs;

use crate::relay::RelayMode;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Delay before retrying when the broker was never reached.
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
    /// Delay before retrying after a mid-session drop.
    #[serde(default = "default_loop_retry_secs")]
    pub loop_retry_secs: u64,
    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,
    #[serde(default = "default_update_topic")]
    pub update_topic: String,
    #[serde(default = "default_relay_topic")]
    pub relay_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Currency units per watt credited.
    #[serde(default = "default_conversion_rate")]
    pub conversion_rate: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            conversion_rate: default_conversion_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub mode: RelayMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path =
            env::var("TELEMETRY_CONFIG").unwrap_or_else(|_| "telemetry-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "telemetry-service".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    256
}

fn default_connect_retry_secs() -> u64 {
    5
}

fn default_loop_retry_secs() -> u64 {
    10
}

fn default_telemetry_topic() -> String {
    "power/monitor".to_string()
}

fn default_update_topic() -> String {
    "power/update".to_string()
}

fn default_relay_topic() -> String {
    "relay/control".to_string()
}

fn default_conversion_rate() -> f64 {
    ledger_core::balance::DEFAULT_CONVERSION_RATE
}
