//! Nearby Wi-Fi access point tracking
//!
//! The checker scans for access points at a fixed pace (slower while battery
//! saver is on). When Wi-Fi is off it switches it on just for the scan and
//! switches it back off once results arrive, a connection is attempted, or the
//! scan cannot start. Each scan replaces the nearby list wholesale.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::modules::Module;
use crate::platform::{ActionResult, PowerControl};
use crate::{Error, Result};

/// Time between two scans
pub const SCAN_EVERY: Duration = Duration::from_secs(150);

/// Time between two scans while battery saver is on
pub const SCAN_EVERY_POWER_SAVER: Duration = Duration::from_secs(600);

/// Wi-Fi hardware as seen by the checker
pub trait WifiRadio: Send + Sync {
    /// Whether the device has Wi-Fi at all
    fn is_supported(&self) -> bool;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool) -> ActionResult;

    /// Ask for a scan; false if it could not be started
    fn start_scan(&self) -> bool;

    /// Results of the last scan
    fn scan_results(&self) -> Vec<ScanResult>;

    /// Drop the current connection attempt; false on failure
    fn disconnect(&self) -> bool;

    /// Scanning needs location access on some platforms
    fn has_location_permission(&self) -> bool;
}

/// One access point from a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub bssid: String,
    pub ssid: String,
    /// Signal level in dBm
    pub level: i32,
    pub trusted: bool,
}

/// Kind of nearby device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Wifi,
    Bluetooth,
}

/// A device detected nearby
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NearbyDevice {
    pub kind: DeviceType,
    /// Upper-cased hardware address
    pub address: String,
    pub detected_at: DateTime<Utc>,
    pub rssi: i32,
    pub name: String,
    pub trusted: bool,
}

/// Wi-Fi state change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    Enabling,
    Enabled,
    Disabling,
    Disabled,
}

/// What a periodic check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAction {
    /// Not due yet, or nothing possible
    Idle,
    /// Wi-Fi was on and a scan was requested
    ScanStarted,
    /// Wi-Fi was off and is being switched on for a scan
    EnablingForScan,
}

/// Read side of the nearby list
///
/// Snapshots are immutable; the checker swaps in a new list per scan.
#[derive(Debug, Clone, Default)]
pub struct NearbyDevices {
    inner: Arc<RwLock<Arc<Vec<NearbyDevice>>>>,
}

impl NearbyDevices {
    /// Current list
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<NearbyDevice>> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, devices: Vec<NearbyDevice>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(devices);
    }
}

/// Periodic Wi-Fi scanner
pub struct WifiChecker {
    radio: Arc<dyn WifiRadio>,
    enabled_by_us: bool,
    scan_every: Duration,
    last_scan: Option<Instant>,
    nearby: NearbyDevices,
}

impl WifiChecker {
    #[must_use]
    pub fn new(radio: Arc<dyn WifiRadio>) -> Self {
        Self {
            radio,
            enabled_by_us: false,
            scan_every: SCAN_EVERY,
            last_scan: None,
            nearby: NearbyDevices::default(),
        }
    }

    /// Handle for readers of the nearby list
    #[must_use]
    pub fn nearby(&self) -> NearbyDevices {
        self.nearby.clone()
    }

    /// Whether Wi-Fi is currently on only because of a scan
    #[must_use]
    pub const fn enabled_by_us(&self) -> bool {
        self.enabled_by_us
    }

    fn set_wifi(&mut self, enabled: bool) {
        if self.radio.set_enabled(enabled) == ActionResult::Ok {
            self.enabled_by_us = enabled;
        }
    }

    /// Start a scan if one is due
    pub fn check(&mut self, now: Instant) -> CheckAction {
        let due = self
            .last_scan
            .is_none_or(|last| now.duration_since(last) >= self.scan_every);
        if !due || !self.radio.is_supported() {
            return CheckAction::Idle;
        }

        if self.radio.is_enabled() {
            // Someone else turned it on, so it must stay on
            self.enabled_by_us = false;
            if self.radio.has_location_permission() && self.radio.start_scan() {
                return CheckAction::ScanStarted;
            }
        } else if self.radio.has_location_permission() {
            self.set_wifi(true);
            if self.enabled_by_us {
                return CheckAction::EnablingForScan;
            }
        }
        CheckAction::Idle
    }

    /// Adjust the scan pace to battery saver
    pub fn power_saver_changed(&mut self, enabled: bool) {
        self.scan_every = if enabled {
            SCAN_EVERY_POWER_SAVER
        } else {
            SCAN_EVERY
        };
    }

    /// React to a Wi-Fi state change; returns true if a scan was started
    pub fn wifi_state_changed(&mut self, state: WifiState) -> bool {
        match state {
            WifiState::Enabled => {
                let started = self.radio.start_scan();
                if !started && self.enabled_by_us {
                    self.set_wifi(false);
                }
                started
            }
            WifiState::Disabling | WifiState::Disabled => {
                self.enabled_by_us = false;
                false
            }
            WifiState::Enabling => false,
        }
    }

    /// Take in fresh scan results
    pub fn scan_results_available(&mut self, updated: bool, now: Instant) {
        let results = (updated && self.radio.has_location_permission())
            .then(|| self.radio.scan_results());
        if self.enabled_by_us {
            self.set_wifi(false);
        }
        let Some(results) = results else {
            return;
        };

        let detected_at = Utc::now();
        let mut devices: Vec<NearbyDevice> = Vec::new();
        for result in results {
            let address = result.bssid.to_uppercase();
            devices.retain(|d| d.address != address);
            devices.push(NearbyDevice {
                kind: DeviceType::Wifi,
                address,
                detected_at,
                rssi: result.level,
                name: result.ssid,
                trusted: result.trusted,
            });
        }

        tracing::debug!(access_points = devices.len(), "wifi scan results");
        self.nearby.replace(devices);
        self.last_scan = Some(now);
    }

    /// A connection is being set up; undo our own enabling
    pub fn network_connecting(&mut self) {
        if self.enabled_by_us && !self.radio.disconnect() {
            self.set_wifi(false);
        }
    }

    /// One check for backends whose events complete synchronously
    pub fn poll(&mut self, now: Instant) -> bool {
        let scanned = match self.check(now) {
            CheckAction::Idle => false,
            CheckAction::ScanStarted => true,
            CheckAction::EnablingForScan => self.wifi_state_changed(WifiState::Enabled),
        };
        if scanned {
            self.scan_results_available(true, now);
        }
        scanned
    }
}

impl std::fmt::Debug for WifiChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiChecker")
            .field("enabled_by_us", &self.enabled_by_us)
            .field("scan_every", &self.scan_every)
            .finish_non_exhaustive()
    }
}

/// Background module driving a [`WifiChecker`]
pub struct SystemChecker {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SystemChecker {
    /// Start polling every `tick`
    ///
    /// # Errors
    ///
    /// Returns error if called outside a Tokio runtime
    pub fn start(
        mut checker: WifiChecker,
        power: Arc<dyn PowerControl>,
        tick: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Module(format!("system checker needs a runtime: {e}")))?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        checker.power_saver_changed(power.battery_saver_enabled());
                        checker.poll(Instant::now());
                    }
                }
            }
        });

        Ok(Self { task, cancel })
    }
}

impl Module for SystemChecker {
    fn is_fully_working(&self) -> bool {
        !self.task.is_finished()
    }

    fn destroy(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.task.abort();
        Ok(())
    }
}
