//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};

use mtlink::config::Config;

pub mod check;
pub mod status;

/// Load the configuration file, falling back to defaults when it is absent.
pub async fn load_config(config_path: &str) -> Result<Config> {
    if !Path::new(config_path).exists() {
        tracing::debug!(path = config_path, "Config file not found, using defaults");
    }
    Config::load(config_path)
        .await
        .with_context(|| format!("failed to load config '{config_path}'"))
}
