//! Configuration management for the Visor assistant

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

use file::VisorConfigFile;

/// Default seconds between two supervisor passes
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;

/// Default watchdog poll interval in milliseconds
const DEFAULT_WATCHDOG_POLL_MS: u64 = 1_000;

/// Default time a detector run may take
const DEFAULT_DETECTOR_TIMEOUT_SECS: u64 = 10;

/// Default haptic acknowledgment after a dispatch that did something
const DEFAULT_ACK_VIBRATION_MS: u64 = 200;

/// Visor configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (recordings, photos, state)
    pub data_dir: PathBuf,

    /// Module supervision
    pub supervisor: SupervisorConfig,

    /// Watchdog timer
    pub watchdog: WatchdogConfig,

    /// Command-detection collaborator
    pub detector: DetectorConfig,

    /// Command dispatch
    pub dispatch: DispatchConfig,

    /// Host platform adapters
    pub host: HostConfig,
}

/// Module supervision configuration
///
/// The defaults restart a broken module on every pass with no ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Time between two reconciliation passes
    pub check_interval: Duration,

    /// Minimum spacing between two restarts of the same module
    pub restart_backoff: Duration,

    /// Restarts in a row after which a module is parked
    pub max_consecutive_restarts: Option<u32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            restart_backoff: Duration::ZERO,
            max_consecutive_restarts: None,
        }
    }
}

/// Watchdog configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Time between two monitor polls
    pub poll_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_WATCHDOG_POLL_MS),
        }
    }
}

/// Command-detection collaborator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Detector executable; detection is unavailable when unset
    pub command: Option<PathBuf>,

    /// Accepted SHA-512 digests of the executable (empty = any)
    pub sha512: Vec<String>,

    /// Time a detector run may take before it is killed
    pub timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            command: None,
            sha512: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_DETECTOR_TIMEOUT_SECS),
        }
    }
}

/// Command dispatch configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Haptic acknowledgment after a dispatch that recognized something
    pub ack_vibration: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_vibration: Duration::from_millis(DEFAULT_ACK_VIBRATION_MS),
        }
    }
}

/// Host platform configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// Let shutdown and reboot commands reach the host
    pub allow_power_actions: bool,
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly given config file cannot be loaded
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let fc = match explicit_path {
            Some(path) => file::read_config_file(path)?,
            None => file::load_config_file(),
        };

        let config = Self::resolve(fc, |key| std::env::var(key).ok());

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        Ok(config)
    }

    /// Resolve a parsed config file against an environment lookup
    pub fn resolve(fc: VisorConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let env_u64 = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());
        let env_bool = |key: &str| env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        let supervisor = SupervisorConfig {
            check_interval: Duration::from_secs(
                env_u64("VISOR_CHECK_INTERVAL_SECS")
                    .or(fc.supervisor.check_interval_secs)
                    .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
                    .max(1),
            ),
            restart_backoff: Duration::from_secs(
                env_u64("VISOR_RESTART_BACKOFF_SECS")
                    .or(fc.supervisor.restart_backoff_secs)
                    .unwrap_or(0),
            ),
            max_consecutive_restarts: env("VISOR_MAX_RESTARTS")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .or(fc.supervisor.max_consecutive_restarts),
        };

        let watchdog = WatchdogConfig {
            poll_interval: Duration::from_millis(
                env_u64("VISOR_WATCHDOG_POLL_MS")
                    .or(fc.watchdog.poll_interval_ms)
                    .unwrap_or(DEFAULT_WATCHDOG_POLL_MS)
                    .max(10),
            ),
        };

        let detector = DetectorConfig {
            command: env("VISOR_DETECTOR")
                .or(fc.detector.command)
                .map(PathBuf::from),
            sha512: fc.detector.sha512,
            timeout: Duration::from_secs(
                env_u64("VISOR_DETECTOR_TIMEOUT_SECS")
                    .or(fc.detector.timeout_secs)
                    .unwrap_or(DEFAULT_DETECTOR_TIMEOUT_SECS)
                    .max(1),
            ),
        };

        let dispatch = DispatchConfig {
            ack_vibration: Duration::from_millis(
                env_u64("VISOR_ACK_VIBRATION_MS")
                    .or(fc.dispatch.ack_vibration_ms)
                    .unwrap_or(DEFAULT_ACK_VIBRATION_MS),
            ),
        };

        let host = HostConfig {
            allow_power_actions: env_bool("VISOR_ALLOW_POWER_ACTIONS")
                .or(fc.host.allow_power_actions)
                .unwrap_or(false),
        };

        // ~/.local/share/visor on Linux
        let data_dir = env("VISOR_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        Self {
            data_dir,
            supervisor,
            watchdog,
            detector,
            dispatch,
            host,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(VisorConfigFile::default(), |_| None)
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from(".visor"), |d| d.data_dir().join("visor"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_baseline_policy() {
        let config = Config::default();
        assert_eq!(config.supervisor.check_interval, Duration::from_secs(10));
        assert_eq!(config.supervisor.restart_backoff, Duration::ZERO);
        assert!(config.supervisor.max_consecutive_restarts.is_none());
        assert_eq!(config.watchdog.poll_interval, Duration::from_secs(1));
        assert_eq!(config.dispatch.ack_vibration, Duration::from_millis(200));
        assert!(!config.host.allow_power_actions);
        assert!(config.detector.command.is_none());
        assert_eq!(config.detector.timeout, Duration::from_secs(10));
    }

    #[test]
    fn detector_timeout_from_file_and_env() {
        let fc: VisorConfigFile = toml::from_str("[detector]\ntimeout_secs = 3\n").unwrap();
        let config = Config::resolve(fc, env_from(&[]));
        assert_eq!(config.detector.timeout, Duration::from_secs(3));

        let config = Config::resolve(
            VisorConfigFile::default(),
            env_from(&[("VISOR_DETECTOR_TIMEOUT_SECS", "0")]),
        );
        assert_eq!(config.detector.timeout, Duration::from_secs(1));
    }

    #[test]
    fn env_overrides_file() {
        let fc: VisorConfigFile = toml::from_str(
            "[supervisor]\ncheck_interval_secs = 30\n[detector]\ncommand = \"/from/file\"\n",
        )
        .unwrap();

        let config = Config::resolve(
            fc,
            env_from(&[
                ("VISOR_CHECK_INTERVAL_SECS", "4"),
                ("VISOR_ALLOW_POWER_ACTIONS", "true"),
            ]),
        );

        assert_eq!(config.supervisor.check_interval, Duration::from_secs(4));
        assert_eq!(config.detector.command, Some(PathBuf::from("/from/file")));
        assert!(config.host.allow_power_actions);
    }

    #[test]
    fn zero_check_interval_is_clamped() {
        let config = Config::resolve(
            VisorConfigFile::default(),
            env_from(&[("VISOR_CHECK_INTERVAL_SECS", "0")]),
        );
        assert_eq!(config.supervisor.check_interval, Duration::from_secs(1));
    }

    #[test]
    fn unparsable_env_falls_back() {
        let config = Config::resolve(
            VisorConfigFile::default(),
            env_from(&[("VISOR_MAX_RESTARTS", "lots")]),
        );
        assert!(config.supervisor.max_consecutive_restarts.is_none());
    }

    #[test]
    fn data_dir_from_env() {
        let config = Config::resolve(
            VisorConfigFile::default(),
            env_from(&[("VISOR_DATA_DIR", "/tmp/visor-test")]),
        );
        assert_eq!(config.data_dir, PathBuf::from("/tmp/visor-test"));
    }
}
