use crate::core::bluetooth::{
    CART_INBOUND_CHAR_FRAGMENT, CART_OUTBOUND_CHAR_FRAGMENT, CART_SERVICE_FRAGMENT,
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_RESOLVE_TIMEOUT_MS, DEFAULT_WRITE_QUEUE_CAPACITY,
    DEFAULT_WRITE_TIMEOUT_MS,
};
use crate::utils::write_json;
use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

const CONFIG_FILE_NAME: &str = "link_config.json";

/// Thresholds a GPS sample must pass before it is sent to the cart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Minimum time between two telemetry writes. 0 disables the check.
    pub min_interval_ms: u64,
    /// Minimum distance from the last sent position, in metres. 0 disables the check.
    pub min_distance_m: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            min_distance_m: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// UUID fragment identifying the cart service
    pub service_fragment: String,
    /// UUID fragment of the notification characteristic
    pub inbound_fragment: String,
    /// UUID fragment of the command characteristic
    pub outbound_fragment: String,
    /// Only list peripherals that advertise a name
    pub require_name: bool,
    pub connect_timeout_ms: u64,
    pub resolve_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub write_queue_capacity: usize,
    pub telemetry: TelemetryConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            service_fragment: CART_SERVICE_FRAGMENT.to_string(),
            inbound_fragment: CART_INBOUND_CHAR_FRAGMENT.to_string(),
            outbound_fragment: CART_OUTBOUND_CHAR_FRAGMENT.to_string(),
            require_name: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            resolve_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Loads the config from `config_dir`, falling back to defaults.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        if !file_path.exists() {
            warn!("Link config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Link config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        if let Err(e) = write_json(&file_path, self).await {
            error!("Failed to save link config: {}", e);
            return Err(e);
        }
        info!("Link config saved to {:?}.", file_path);
        Ok(())
    }
}
