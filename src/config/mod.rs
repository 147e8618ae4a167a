pub mod bill_config;
pub mod link_config;

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::bill_config::BillConfig;
use crate::config::link_config::LinkConfig;

const APP_DIR_NAME: &str = "smartcart-link";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub bill: BillConfig,
}

impl AppConfig {
    pub async fn load(config_dir: &Path) -> Result<Self> {
        Ok(AppConfig {
            link: LinkConfig::load_config(config_dir).await?,
            bill: BillConfig::load_config(config_dir).await?,
        })
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.link.save_config(config_dir).await?;
        self.bill.save_config(config_dir).await
    }
}

/// Platform config directory for this application
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Platform data directory, where documents are kept
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}
