pub mod logging_config;
pub mod manager_config;

use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::logging_config::LoggingConfig;
use crate::config::manager_config::ManagerConfig;
use crate::utils::ensure_directory_exists;

pub use logging_config::LogFormat;

pub const CONFIG_FILE_NAME: &str = "ble_center.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub manager: ManagerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads the config from `file_path`.
    ///
    /// A missing file yields the defaults, which are written back so the user
    /// has something to edit. A malformed file is an error.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            let config = Self::default();
            if let Err(e) = config.save_config(file_path).await {
                warn!("Failed to write default config: {:#}", e);
            }
            return Ok(config);
        }

        let config_json = fs::read_to_string(file_path)
            .await
            .with_context(|| format!("reading config {:?}", file_path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing config {:?}", file_path))?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the config to `file_path`, creating parent directories.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        if let Some(config_dir) = file_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Config saved to {:?}.", file_path);
        Ok(())
    }
}
