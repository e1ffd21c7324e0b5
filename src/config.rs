//! Configuration management for KVChain

use crate::blockchain::Visibility;
use crate::error::{ChainError, Result};
use crate::miner::Difficulty;
use crate::persistence::{Database, FileStore, Persistence};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_chain_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_chain_path(),
        }
    }
}

impl StorageConfig {
    pub fn open(&self) -> Result<Box<dyn Persistence>> {
        Ok(match self.backend {
            StorageBackend::File => Box::new(FileStore::new(&self.path)),
            StorageBackend::Sqlite => Box::new(Database::open(&self.path)?),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default = "default_modulus")]
    pub modulus: u32,
    #[serde(default = "default_accepted_below")]
    pub accepted_below: u32,
    /// Humantime string such as "30s" or "2m".
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            modulus: default_modulus(),
            accepted_below: default_accepted_below(),
            timeout: default_timeout(),
        }
    }
}

impl MinerConfig {
    pub fn difficulty(&self) -> Result<Difficulty> {
        Difficulty::new(self.modulus, self.accepted_below)
    }

    pub fn timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.timeout)
            .map_err(|e| ChainError::ConfigError(format!("miner.timeout {:?}: {}", self.timeout, e)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub client_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<tracing::Level> {
        self.level
            .parse()
            .map_err(|_| ChainError::ConfigError(format!("unknown log level {:?}", self.level)))
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.storage.path.is_empty() {
            return Err(ChainError::ConfigError("storage.path must be set".to_string()));
        }
        self.miner.difficulty()?;
        self.miner.timeout()?;
        self.logging.level()?;
        Ok(())
    }
}

/// `config.toml` in the platform configuration directory, if one exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kvchain").join(CONFIG_FILE_NAME))
}

/// Load and validate the configuration at `path`. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let config: Config = match fs::read_to_string(path) {
        Ok(config_str) => toml::from_str(&config_str)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

/// Load `./config.toml`, falling back to the platform config directory.
pub fn load_config() -> Result<Config> {
    let local = Path::new(CONFIG_FILE_NAME);
    if local.exists() {
        return load_config_from(local);
    }
    match default_config_path() {
        Some(path) => load_config_from(&path),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_chain_path() -> String {
    "./kvchain.bin".to_string()
}

fn default_modulus() -> u32 {
    Difficulty::default().modulus
}

fn default_accepted_below() -> u32 {
    Difficulty::default().accepted_below
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
