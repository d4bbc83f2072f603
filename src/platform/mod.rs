//! Platform collaborators
//!
//! Capability interfaces through which the core reaches the device: radios,
//! power, telephony, media playback, battery, the clock and the command
//! detection classifier. Speech, haptics, camera, recorder and recognizer
//! control go over the action bus instead.

pub mod host;

use std::sync::Arc;

use serde::Serialize;

use crate::Result;

/// Structured result of a hardware action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Ok,
    PermissionDenied,
    AlreadyEnabled,
    AlreadyEnabling,
    AlreadyDisabled,
    AlreadyDisabling,
    /// The hardware is not present
    NoAdapter,
    GeneralError,
    /// The platform cannot do this at all
    Unsupported,
    /// Platform-specific code with no meaning to the core
    Other(i32),
}

impl ActionResult {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Radio that can be switched on and off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Radio {
    Wifi,
    MobileData,
    Bluetooth,
    AirplaneMode,
}

/// Reboot target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootMode {
    Normal,
    Safe,
    Recovery,
    Bootloader,
    /// Userspace-only restart
    Fast,
}

/// Media transport key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKey {
    Stop,
    Pause,
    Play,
    Next,
    Previous,
}

/// Last known battery readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatteryState {
    /// `None` until the first reading
    pub present: Option<bool>,
    /// `None` until the first reading
    pub percentage: Option<u8>,
}

/// Natural-language command classifier
///
/// Returns either an error-prefixed diagnostic or a separator-delimited
/// sequence of command tokens.
pub trait CommandDetector: Send + Sync {
    /// Whether the classifier can be used at all
    fn is_available(&self) -> bool;

    /// Classify an utterance
    ///
    /// # Errors
    ///
    /// Returns error if the classifier could not be run
    fn detect(&self, utterance: &str) -> Result<String>;
}

/// Radio switches
pub trait Connectivity: Send + Sync {
    fn set_radio(&self, radio: Radio, enabled: bool) -> ActionResult;
}

/// Device power
pub trait PowerControl: Send + Sync {
    fn shut_down(&self) -> ActionResult;

    fn reboot(&self, mode: RebootMode) -> ActionResult;

    fn set_battery_saver(&self, enabled: bool) -> ActionResult;

    /// Whether battery saver is on right now
    fn battery_saver_enabled(&self) -> bool;
}

/// Phone calls
pub trait Telephony: Send + Sync {
    fn answer_call(&self) -> ActionResult;

    fn end_call(&self) -> ActionResult;

    fn set_speakerphone(&self, enabled: bool) -> ActionResult;
}

/// Media playback control
pub trait MediaSession: Send + Sync {
    /// Whether something is playing right now
    fn is_playing(&self) -> bool;

    /// Press a transport key (down then up)
    fn send_key(&self, key: MediaKey) -> ActionResult;
}

/// Device readings
pub trait DeviceState: Send + Sync {
    fn battery(&self) -> BatteryState;
}

/// Wall clock, formatted for speech
pub trait Clock: Send + Sync {
    /// Current time, e.g. `"14:05"`
    fn time_string(&self) -> String;

    /// Current date, e.g. `"Saturday, October 17, 2026"`
    fn date_string(&self) -> String;
}

/// Local time zone clock
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn time_string(&self) -> String {
        chrono::Local::now().format("%H:%M").to_string()
    }

    fn date_string(&self) -> String {
        chrono::Local::now().format("%A, %B %-d, %Y").to_string()
    }
}

/// Every collaborator the dispatch engine talks to
#[derive(Clone)]
pub struct Platform {
    pub detector: Arc<dyn CommandDetector>,
    pub connectivity: Arc<dyn Connectivity>,
    pub power: Arc<dyn PowerControl>,
    pub telephony: Arc<dyn Telephony>,
    pub media: Arc<dyn MediaSession>,
    pub device: Arc<dyn DeviceState>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
