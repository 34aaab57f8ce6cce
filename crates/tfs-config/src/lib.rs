//! # tfs-config
//!
//! Configuration management for tfs.
//!
//! Loads configuration from:
//! 1. `~/.tfs/config.toml` (global)
//! 2. `.tfs/config.toml` (local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tfs_codec::CodecChain;
use tfs_fs::FsOptions;
use tfs_storage::BackendKind;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

pub const ENV_STORAGE_DIR: &str = "TFS_STORAGE_DIR";
pub const ENV_PASSWORD: &str = "TFS_PASSWORD";
pub const ENV_ROOT_NAME: &str = "TFS_ROOT_NAME";
pub const ENV_BACKEND: &str = "TFS_BACKEND";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub fs: FsConfig,
    pub sync: SyncConfig,
    pub mount: MountConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                layers.push(std::fs::read_to_string(&global_path)?);
            }
        }
        let local_path = Self::local_config_path();
        if local_path.exists() {
            debug!("Loading local config from {:?}", local_path);
            layers.push(std::fs::read_to_string(&local_path)?);
        }

        let mut config = Self::from_layers(&layers)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a single file, without environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Build a config from TOML documents, later ones overriding earlier
    /// ones key by key.
    pub fn from_layers(layers: &[String]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for layer in layers {
            merge_tables(&mut merged, toml::from_str(layer)?);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.tfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".tfs/config.toml"))
    }

    pub fn local_config_path() -> PathBuf {
        PathBuf::from(".tfs/config.toml")
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var(ENV_STORAGE_DIR) {
            self.storage.directory = PathBuf::from(dir);
        }
        if let Some(password) = var(ENV_PASSWORD) {
            self.crypto.password = password;
        }
        if let Some(name) = var(ENV_ROOT_NAME) {
            self.fs.root_name = name;
        }
        if let Some(backend) = var(ENV_BACKEND) {
            self.storage.backend = backend;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }

    /// Storage directory with a leading `~` expanded
    pub fn storage_dir(&self) -> PathBuf {
        expand_home(&self.storage.directory)
    }

    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        BackendKind::from_str(&self.storage.backend).map_err(|_| ConfigError::Invalid {
            key: "storage.backend",
            value: self.storage.backend.clone(),
        })
    }

    /// Codec chain for blocks at rest and on the sync wire
    pub fn codec(&self) -> CodecChain {
        CodecChain::for_password(
            &self.crypto.password,
            &self.crypto.salt,
            self.crypto.iterations,
            self.crypto.compress,
        )
    }

    pub fn fs_options(&self) -> FsOptions {
        FsOptions {
            root_name: self.fs.root_name.clone(),
            embedded_size: self.fs.embedded_size,
            extent_size: self.fs.extent_size,
            node_max_size: self.fs.node_max_size,
            cache_size: self.storage.cache_size,
            writes_per_cpu: self.fs.writes_per_cpu,
        }
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(table)) => {
                merge_tables(existing, table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the block backend
    pub directory: PathBuf,
    /// memory, file, lmdb or log
    pub backend: String,
    /// Decoded tree nodes kept in memory
    pub cache_size: usize,
    /// Seconds between background flushes of long-running commands
    pub flush_interval_secs: u64,
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("~/.tfs/storage"),
            backend: BackendKind::default().to_string(),
            cache_size: FsOptions::default().cache_size,
            flush_interval_secs: 5,
        }
    }
}

/// Block encryption and compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Empty disables encryption
    pub password: String,
    pub salt: String,
    pub iterations: u32,
    pub compress: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            salt: "tfs".to_string(),
            iterations: 10_000,
            compress: true,
        }
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Store name the filesystem root is published under
    pub root_name: String,
    pub embedded_size: usize,
    pub extent_size: usize,
    pub node_max_size: usize,
    pub writes_per_cpu: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        let options = FsOptions::default();
        Self {
            root_name: options.root_name,
            embedded_size: options.embedded_size,
            extent_size: options.extent_size,
            node_max_size: options.node_max_size,
            writes_per_cpu: options.writes_per_cpu,
        }
    }
}

/// Sync endpoint and connector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Address `tfs serve` listens on
    pub listen: String,
    /// Endpoint of the other side, if any
    pub peer: Option<String>,
    /// Name the local store keeps the peer's tree under
    pub other_root_name: String,
    pub peer_root_name: String,
    /// Name the peer keeps our tree under
    pub peer_other_root_name: String,
    pub interval_secs: u64,
    /// Concurrent block copies; unset picks one per CPU
    pub parallelism: Option<usize>,
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7420".to_string(),
            peer: None,
            other_root_name: "remote".to_string(),
            peer_root_name: "fs".to_string(),
            peer_other_root_name: "remote".to_string(),
            interval_secs: 30,
            parallelism: None,
        }
    }
}

/// Kernel mount settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub mountpoint: Option<PathBuf>,
    pub allow_other: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[crypto]"));
        assert!(toml_str.contains("[fs]"));
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("root_name = \"fs\""));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.fs.extent_size, config.fs.extent_size);
        assert_eq!(parsed.storage.backend, "file");
    }

    #[test]
    fn test_local_layer_overrides_per_key() {
        let global = "[storage]\nbackend = \"lmdb\"\ncache_size = 10\n".to_string();
        let local = "[storage]\ncache_size = 20\n[fs]\nroot_name = \"work\"\n".to_string();
        let config = Config::from_layers(&[global, local]).unwrap();
        assert_eq!(config.storage.backend, "lmdb");
        assert_eq!(config.storage.cache_size, 20);
        assert_eq!(config.fs.root_name, "work");
        assert_eq!(config.fs.extent_size, tfs_fs::DEFAULT_EXTENT_SIZE);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            ENV_STORAGE_DIR => Some("/srv/tfs".to_string()),
            ENV_PASSWORD => Some("hunter2".to_string()),
            ENV_BACKEND => Some("memory".to_string()),
            _ => None,
        });
        assert_eq!(config.storage_dir(), PathBuf::from("/srv/tfs"));
        assert_eq!(config.crypto.password, "hunter2");
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Memory);
        assert_eq!(config.fs.root_name, "fs");
        assert!(!config.codec().is_identity());
    }

    #[test]
    fn test_bad_backend_rejected() {
        let mut config = Config::default();
        config.storage.backend = "tape".to_string();
        assert!(matches!(
            config.backend_kind(),
            Err(ConfigError::Invalid { key: "storage.backend", .. })
        ));
    }

    #[test]
    fn test_home_expansion() {
        let config = Config::default();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.storage_dir(), home.join(".tfs/storage"));
        }
    }
}
