//! Configuration file support for frflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FRFLASH_*)
//! 3. Local config file (./frflash.toml)
//! 4. Global config file (~/.config/frflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG: &str = "frflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial device (e.g., "/dev/ttyUSB0" or "COM3").
    pub device: Option<String>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default chip family.
    pub chip: Option<String>,
    /// Second-stage loader image for FR targets.
    pub loader: Option<PathBuf>,
    /// Read the uploaded loader back.
    #[serde(default)]
    pub verify_upload: bool,
    /// Key to try first on locked R32C parts (`ADDR:VALUE`, hex).
    pub key: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "frflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Directory installed data files (the default loader) live in.
    pub fn data_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "frflash").map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.device.is_some() {
            self.connection.device = other.connection.device;
        }

        if other.flash.chip.is_some() {
            self.flash.chip = other.flash.chip;
        }
        if other.flash.loader.is_some() {
            self.flash.loader = other.flash.loader;
        }
        if other.flash.verify_upload {
            self.flash.verify_upload = true;
        }
        if other.flash.key.is_some() {
            self.flash.key = other.flash.key;
        }
    }
}
