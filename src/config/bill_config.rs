use crate::utils::{read_json, write_json};
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CONFIG_FILE_NAME: &str = "bill_config.json";

/// Bill settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillConfig {
    /// Tax applied on the subtotal, as a fraction
    pub tax_rate: f64,
    /// Currency label printed after amounts
    pub currency: String,
}

impl Default for BillConfig {
    fn default() -> Self {
        BillConfig {
            tax_rate: 0.05,
            currency: "RM".to_string(),
        }
    }
}

impl BillConfig {
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        match read_json(&file_path).await? {
            Some(config) => {
                info!("Bill config loaded from {:?}", file_path);
                Ok(config)
            }
            None => {
                warn!("Bill config file not found at {:?}, using default.", file_path);
                Ok(Self::default())
            }
        }
    }

    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        write_json(&file_path, self).await?;
        info!("Bill config saved to {:?}", file_path);
        Ok(())
    }
}
