//! Operator configuration loader.
//!
//! Reads `config.toml` from the Tako data directory and deserializes it
//! into [`GlobalConfig`]. Falls back to defaults when the file is missing
//! or malformed.

use std::path::Path;

use tako_types::config::GlobalConfig;

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns [`GlobalConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "no config.toml at {}, using defaults",
                config_path.display()
            );
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}
