//! Config file load and render logic.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use crate::config::types::Config;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostfaultd/config.json";

pub async fn load_config(path: Option<&str>) -> Result<Config> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if config_path.exists() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read config file {config_path:?}"))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {config_path:?}"))?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {config_path:?}: {e}"))?;

        info!("Loaded configuration from: {:?}", config_path);
        Ok(config)
    } else {
        info!(
            "Config file not found at {:?}, using platform defaults",
            config_path
        );
        Ok(Config::default())
    }
}

/// Render the effective configuration for `--show-config`.
pub fn render_config(config: &Config) -> Result<String> {
    serde_json::to_string_pretty(config).context("Failed to serialize configuration")
}
