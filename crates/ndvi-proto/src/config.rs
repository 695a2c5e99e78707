use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::configuration::Configuration;
use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Where the remote compute service and its push channel live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_push_address")]
    pub push_address: String,
    /// Applies to establishing connections only; requests themselves run
    /// until they resolve or are superseded.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_layer_name")]
    pub layer_name: String,
    /// Buffer size of the session update broadcast.
    #[serde(default = "default_update_capacity")]
    pub update_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// How long a removed alert stays hidden before it is deleted.  `0` means
    /// wait for the renderer to acknowledge the fade-out.
    #[serde(default = "default_fade_out_ms")]
    pub fade_out_ms: u64,
}

/// Initial values for the option form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    #[serde(default = "default_end_year")]
    pub end_year: i32,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_regression")]
    pub regression: String,
    #[serde(default = "default_cloudscore")]
    pub cloudscore: i64,
    #[serde(default = "default_filename")]
    pub filename: String,
}

impl DefaultsConfig {
    /// A configuration with no geometry, built from these defaults.
    pub fn configuration(&self) -> Configuration {
        Configuration::new(
            self.start_year,
            self.end_year,
            self.source.clone(),
            self.regression.clone(),
        )
        .with_cloudscore(self.cloudscore)
        .with_filename(self.filename.clone())
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            push_address: default_push_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            layer_name: default_layer_name(),
            update_capacity: default_update_capacity(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            fade_out_ms: default_fade_out_ms(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            start_year: default_start_year(),
            end_year: default_end_year(),
            source: default_source(),
            regression: default_regression(),
            cloudscore: default_cloudscore(),
            filename: default_filename(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_push_address() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_layer_name() -> String {
    "ndvi".to_string()
}

fn default_update_capacity() -> usize {
    256
}

fn default_fade_out_ms() -> u64 {
    500
}

fn default_start_year() -> i32 {
    2000
}

fn default_end_year() -> i32 {
    2015
}

fn default_source() -> String {
    "all".to_string()
}

fn default_regression() -> String {
    "poly1".to_string()
}

fn default_cloudscore() -> i64 {
    10
}

fn default_filename() -> String {
    "ndvi_trend".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
