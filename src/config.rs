//! Configuration management for bismo-host.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`BISMO_FCLK_MHZ`, `BISMO_RUN_TIMEOUT_MS`)
//! 2. Project-local config file (`./bismo-host.toml`)
//! 3. User config file (`~/.config/bismo-host/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # bismo-host.toml
//!
//! # Accelerator clock in MHz, used to convert cycles to time
//! fclk_mhz = 150.0
//!
//! # Abandon a run that has not drained after this many milliseconds
//! run_timeout_ms = 5000
//!
//! # Geometry of the emulated accelerator
//! [emulator]
//! dpa_dim_lhs = 8
//! # ...
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::hw::{HardwareCapability, DEFAULT_FCLK_MHZ};

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// bismo-host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Accelerator clock frequency in MHz.
    pub fclk_mhz: f64,

    /// Run deadline in milliseconds. Unset means wait forever.
    pub run_timeout_ms: Option<u64>,

    /// Geometry of the emulated accelerator.
    /// Unset means the 8x256x8 reference instance.
    pub emulator: Option<HardwareCapability>,
}

impl Default for Config {
    fn default() -> Self {
        Self { fclk_mhz: DEFAULT_FCLK_MHZ, run_timeout_ms: None, emulator: None }
    }
}

/// One file's worth of settings. Absent keys leave lower-priority values alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    fclk_mhz: Option<f64>,
    run_timeout_ms: Option<u64>,
    emulator: Option<HardwareCapability>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `bismo-host.toml`
    /// 3. User config `~/.config/bismo-host/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Run deadline, if one is configured.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Emulated device geometry, with fallback to the reference instance.
    pub fn emulator_capability(&self) -> HardwareCapability {
        self.emulator.unwrap_or_default()
    }

    fn load_user_config() -> Option<ConfigFile> {
        Self::load_from_file(&Self::user_config_path()?)
    }

    fn load_local_config() -> Option<ConfigFile> {
        let local_path = Path::new("bismo-host.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("bismo-host.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    fn load_from_file(path: &Path) -> Option<ConfigFile> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Only overrides fields that are set in the other file.
    fn merge(&mut self, other: ConfigFile) {
        if let Some(fclk) = other.fclk_mhz {
            self.fclk_mhz = fclk;
        }
        if other.run_timeout_ms.is_some() {
            self.run_timeout_ms = other.run_timeout_ms;
        }
        if other.emulator.is_some() {
            self.emulator = other.emulator;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("BISMO_FCLK_MHZ") {
            match value.parse::<f64>() {
                Ok(fclk) if fclk > 0.0 => {
                    log::info!("Using BISMO_FCLK_MHZ from environment: {}", fclk);
                    self.fclk_mhz = fclk;
                }
                _ => log::warn!("Ignoring invalid BISMO_FCLK_MHZ={:?}", value),
            }
        }
        if let Ok(value) = std::env::var("BISMO_RUN_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => {
                    log::info!("Using BISMO_RUN_TIMEOUT_MS from environment: {}", ms);
                    self.run_timeout_ms = Some(ms);
                }
                Err(_) => log::warn!("Ignoring invalid BISMO_RUN_TIMEOUT_MS={:?}", value),
            }
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bismo-host").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# bismo-host configuration
# Place this file at ~/.config/bismo-host/config.toml or ./bismo-host.toml

# Accelerator clock in MHz (defaults to 200)
fclk_mhz = 200.0

# Abandon runs that have not finished after this many milliseconds
# (defaults to waiting forever)
# run_timeout_ms = 5000

# Geometry of the emulated accelerator (defaults to 8x256x8)
# [emulator]
# acc_width = 32
# cmd_queue_entries = 16
# dpa_dim_common = 256
# dpa_dim_lhs = 8
# dpa_dim_rhs = 8
# lhs_entries_per_mem = 1024
# max_shift_steps = 16
# read_chan_width = 64
# rhs_entries_per_mem = 1024
# write_chan_width = 64
"#
        .to_string()
    }
}
