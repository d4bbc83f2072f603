//! TOML configuration file loading
//!
//! Supports `~/.config/visor/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VisorConfigFile {
    /// Data directory override
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Module supervision
    #[serde(default)]
    pub supervisor: SupervisorFileConfig,

    /// Watchdog timer
    #[serde(default)]
    pub watchdog: WatchdogFileConfig,

    /// Command-detection collaborator
    #[serde(default)]
    pub detector: DetectorFileConfig,

    /// Command dispatch
    #[serde(default)]
    pub dispatch: DispatchFileConfig,

    /// Host platform adapters
    #[serde(default)]
    pub host: HostFileConfig,
}

/// Supervisor configuration
#[derive(Debug, Default, Deserialize)]
pub struct SupervisorFileConfig {
    /// Seconds between two reconciliation passes
    pub check_interval_secs: Option<u64>,

    /// Minimum seconds between two restarts of the same module
    pub restart_backoff_secs: Option<u64>,

    /// Restarts in a row after which a module is parked
    pub max_consecutive_restarts: Option<u32>,
}

/// Watchdog configuration
#[derive(Debug, Default, Deserialize)]
pub struct WatchdogFileConfig {
    /// Milliseconds between two monitor polls
    pub poll_interval_ms: Option<u64>,
}

/// Command-detection collaborator configuration
#[derive(Debug, Default, Deserialize)]
pub struct DetectorFileConfig {
    /// Path to the detector executable
    pub command: Option<String>,

    /// Accepted SHA-512 digests of the executable (hex)
    #[serde(default)]
    pub sha512: Vec<String>,

    /// Seconds a detector run may take
    pub timeout_secs: Option<u64>,
}

/// Command dispatch configuration
#[derive(Debug, Default, Deserialize)]
pub struct DispatchFileConfig {
    /// Haptic acknowledgment length in milliseconds
    pub ack_vibration_ms: Option<u64>,
}

/// Host platform configuration
#[derive(Debug, Default, Deserialize)]
pub struct HostFileConfig {
    /// Allow shutdown and reboot commands to reach the host
    pub allow_power_actions: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VisorConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VisorConfigFile {
    let Some(path) = config_file_path() else {
        return VisorConfigFile::default();
    };

    if !path.exists() {
        return VisorConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VisorConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<VisorConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/visor/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("visor").join("config.toml"))
}
