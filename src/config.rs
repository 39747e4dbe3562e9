use std::collections::HashSet;

use anyhow::{anyhow, Result};
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

const DEFAULT_UPDATE_TTL: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seconds the aggregator batches status edits before transmitting.
    pub unit_status_send_period: u64,
    /// Directory holding downloaded and decrypted artifacts; purged when no
    /// update is running. Empty disables the purge.
    pub decrypt_dir: String,
    pub um_controller: UmControllerConfig,
    pub sm_controller: SmControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UmControllerConfig {
    #[serde(default)]
    pub um_clients: Vec<UmClientConfig>,
    /// Default firmware update lifetime in seconds, applied when the
    /// schedule carries no TTL.
    pub update_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmControllerConfig {
    /// Default software update lifetime in seconds.
    pub update_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UmClientConfig {
    pub um_id: String,
    pub priority: u32,
    #[serde(default)]
    pub is_local: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            unit_status_send_period: 30,
            decrypt_dir: String::new(),
            um_controller: UmControllerConfig::default(),
            sm_controller: SmControllerConfig::default(),
        }
    }
}

impl Default for UmControllerConfig {
    fn default() -> Self {
        UmControllerConfig {
            um_clients: Vec::new(),
            update_ttl: DEFAULT_UPDATE_TTL,
        }
    }
}

impl Default for SmControllerConfig {
    fn default() -> Self {
        SmControllerConfig {
            update_ttl: DEFAULT_UPDATE_TTL,
        }
    }
}

impl Config {
    pub fn from_yaml(config_str: &str) -> Result<Config> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(config_str))
            .extract()?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_path(path: &str) -> Result<Config> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        let mut um_ids = HashSet::new();

        for client in &self.um_controller.um_clients {
            if client.um_id.is_empty() {
                return Err(anyhow!("um client id is empty"));
            }

            if !um_ids.insert(client.um_id.as_str()) {
                return Err(anyhow!("duplicate um client id: {}", client.um_id));
            }
        }

        Ok(())
    }
}
