/// `load_config` module: Loads a static YAML config, applies environment overrides,
/// and hands back the typed sections the CLI needs.
///
/// This module is the only place where user-supplied YAML is parsed.
///
/// # Responsibilities
/// - Parse the YAML file into [`CliConfig`] (`database`, `remote`, `sync` sections)
/// - Fill omitted sections with their defaults
/// - Let `STATS_MIRROR_DATABASE_URL` override the database URL, so secrets and
///   per-host paths can stay out of the file
/// - Log and report every failure with the offending path
///
/// # Errors
/// All errors in this module use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::Result;
use serde::Deserialize;
use stats_mirror_core::config::SyncSettings;
use stats_mirror_core::remote::ApiClientConfig;
use std::fs;
use std::path::Path;
use tracing::{error, info};

pub const DATABASE_URL_ENV: &str = "STATS_MIRROR_DATABASE_URL";

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub remote: ApiClientConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        DatabaseSection {
            url: "sqlite://stats-mirror.db".to_string(),
        }
    }
}

/// Loads a YAML config file and applies environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let mut config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
        if !url.trim().is_empty() {
            info!(env = DATABASE_URL_ENV, "Database URL taken from environment");
            config.database.url = url;
        }
    }

    Ok(config)
}
