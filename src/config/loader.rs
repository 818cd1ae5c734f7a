use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ProxyConfig;

/// Prefix of environment overrides, e.g. `APPS_PROXY__API__TOKEN`.
pub const ENV_PREFIX: &str = "APPS_PROXY";

/// Load configuration from a file overlaid with environment variables.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ProxyConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously. A missing file is fine as long as the
/// environment provides the required keys.
pub fn load_config_sync(config_path: &str) -> Result<ProxyConfig> {
    load_config_with_env(config_path, Environment::with_prefix(ENV_PREFIX).separator("__"))
}

fn load_config_with_env(config_path: &str, env: Environment) -> Result<ProxyConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(
            File::new(
                config_path
                    .to_str()
                    .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
                format,
            )
            .required(false),
        )
        .add_source(env.try_parsing(true))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let proxy_config: ProxyConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(proxy_config)
}
