//! Linux host adapters
//!
//! Best-effort implementations on top of common desktop tools: `nmcli` for
//! Wi-Fi and mobile data, `rfkill` for Bluetooth and airplane mode,
//! `playerctl` for media, sysfs for the battery, `powerprofilesctl` for
//! battery saver and `systemctl` for power actions. A missing tool is
//! reported as [`ActionResult::Unsupported`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use super::{
    ActionResult, BatteryState, CommandDetector, Connectivity, DeviceState, LocalClock,
    MediaKey, MediaSession, Platform, PowerControl, Radio, RebootMode, Telephony,
};
use crate::config::HostConfig;
use crate::connectivity::{ScanResult, WifiRadio};

const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// Run a tool and map its outcome
fn run_tool(program: &str, args: &[&str]) -> ActionResult {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => ActionResult::Ok,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            tracing::debug!(program, ?args, stderr = %stderr.trim(), "host tool failed");
            if stderr.contains("not authorized")
                || stderr.contains("permission denied")
                || stderr.contains("insufficient privileges")
            {
                ActionResult::PermissionDenied
            } else {
                output
                    .status
                    .code()
                    .map_or(ActionResult::GeneralError, ActionResult::Other)
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(program, "host tool not installed");
            ActionResult::Unsupported
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => ActionResult::PermissionDenied,
        Err(e) => {
            tracing::debug!(program, error = %e, "host tool could not run");
            ActionResult::GeneralError
        }
    }
}

/// Run a tool and capture its stdout if it succeeded
fn tool_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

/// Linux desktop implementation of the platform collaborators
#[derive(Debug, Clone)]
pub struct HostPlatform {
    allow_power_actions: bool,
    power_supply_dir: PathBuf,
}

impl HostPlatform {
    #[must_use]
    pub fn new(config: &HostConfig) -> Self {
        Self {
            allow_power_actions: config.allow_power_actions,
            power_supply_dir: PathBuf::from(POWER_SUPPLY_DIR),
        }
    }

    /// Read batteries from another sysfs directory
    #[must_use]
    pub fn with_power_supply_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.power_supply_dir = dir.into();
        self
    }

    /// Bundle this host with a detector into a full platform
    #[must_use]
    pub fn into_platform(self, detector: Arc<dyn CommandDetector>) -> Platform {
        let host = Arc::new(self);
        Platform {
            detector,
            connectivity: host.clone(),
            power: host.clone(),
            telephony: host.clone(),
            media: host.clone(),
            device: host,
            clock: Arc::new(LocalClock),
        }
    }

    fn nmcli_radio(kind: &str) -> Option<bool> {
        let out = tool_output("nmcli", &["radio", kind])?;
        match out.trim() {
            "enabled" => Some(true),
            "disabled" => Some(false),
            _ => None,
        }
    }

    fn set_nmcli_radio(kind: &str, enabled: bool) -> ActionResult {
        match Self::nmcli_radio(kind) {
            Some(true) if enabled => ActionResult::AlreadyEnabled,
            Some(false) if !enabled => ActionResult::AlreadyDisabled,
            _ => run_tool("nmcli", &["radio", kind, on_off(enabled)]),
        }
    }

    fn set_bluetooth(enabled: bool) -> ActionResult {
        let Some(listing) = tool_output("rfkill", &["list", "bluetooth"]) else {
            return run_tool("rfkill", &["list", "bluetooth"]);
        };
        if listing.trim().is_empty() {
            return ActionResult::NoAdapter;
        }
        let blocked = listing.contains("Soft blocked: yes");
        match (enabled, blocked) {
            (true, false) => ActionResult::AlreadyEnabled,
            (false, true) => ActionResult::AlreadyDisabled,
            _ => run_tool(
                "rfkill",
                &[if enabled { "unblock" } else { "block" }, "bluetooth"],
            ),
        }
    }

    fn power_action(&self, args: &[&str]) -> ActionResult {
        if !self.allow_power_actions {
            tracing::warn!(?args, "power action refused by configuration");
            return ActionResult::PermissionDenied;
        }
        run_tool("systemctl", args)
    }
}

impl Connectivity for HostPlatform {
    fn set_radio(&self, radio: Radio, enabled: bool) -> ActionResult {
        match radio {
            Radio::Wifi => Self::set_nmcli_radio("wifi", enabled),
            Radio::MobileData => Self::set_nmcli_radio("wwan", enabled),
            Radio::Bluetooth => Self::set_bluetooth(enabled),
            Radio::AirplaneMode => {
                run_tool("rfkill", &[if enabled { "block" } else { "unblock" }, "all"])
            }
        }
    }
}

impl PowerControl for HostPlatform {
    fn shut_down(&self) -> ActionResult {
        self.power_action(&["poweroff"])
    }

    fn reboot(&self, mode: RebootMode) -> ActionResult {
        match mode {
            RebootMode::Normal => self.power_action(&["reboot"]),
            RebootMode::Fast => self.power_action(&["soft-reboot"]),
            RebootMode::Bootloader => self.power_action(&["reboot", "--firmware-setup"]),
            RebootMode::Recovery => self.power_action(&["rescue"]),
            RebootMode::Safe => ActionResult::Unsupported,
        }
    }

    fn set_battery_saver(&self, enabled: bool) -> ActionResult {
        if self.battery_saver_enabled() == enabled {
            return if enabled {
                ActionResult::AlreadyEnabled
            } else {
                ActionResult::AlreadyDisabled
            };
        }
        let profile = if enabled { "power-saver" } else { "balanced" };
        run_tool("powerprofilesctl", &["set", profile])
    }

    fn battery_saver_enabled(&self) -> bool {
        tool_output("powerprofilesctl", &["get"]).is_some_and(|p| p.trim() == "power-saver")
    }
}

impl Telephony for HostPlatform {
    fn answer_call(&self) -> ActionResult {
        ActionResult::Unsupported
    }

    fn end_call(&self) -> ActionResult {
        ActionResult::Unsupported
    }

    fn set_speakerphone(&self, _enabled: bool) -> ActionResult {
        ActionResult::Unsupported
    }
}

impl MediaSession for HostPlatform {
    fn is_playing(&self) -> bool {
        tool_output("playerctl", &["status"]).is_some_and(|s| s.trim() == "Playing")
    }

    fn send_key(&self, key: MediaKey) -> ActionResult {
        let verb = match key {
            MediaKey::Stop => "stop",
            MediaKey::Pause => "pause",
            MediaKey::Play => "play",
            MediaKey::Next => "next",
            MediaKey::Previous => "previous",
        };
        run_tool("playerctl", &[verb])
    }
}

impl DeviceState for HostPlatform {
    fn battery(&self) -> BatteryState {
        read_battery(&self.power_supply_dir)
    }
}

impl WifiRadio for HostPlatform {
    fn is_supported(&self) -> bool {
        Self::nmcli_radio("wifi").is_some()
    }

    fn is_enabled(&self) -> bool {
        Self::nmcli_radio("wifi").unwrap_or(false)
    }

    fn set_enabled(&self, enabled: bool) -> ActionResult {
        run_tool("nmcli", &["radio", "wifi", on_off(enabled)])
    }

    fn start_scan(&self) -> bool {
        run_tool("nmcli", &["device", "wifi", "rescan"]).is_ok()
    }

    fn scan_results(&self) -> Vec<ScanResult> {
        tool_output(
            "nmcli",
            &["-t", "-f", "BSSID,SSID,SIGNAL", "device", "wifi", "list"],
        )
        .map(|out| parse_nmcli_wifi_list(&out))
        .unwrap_or_default()
    }

    fn disconnect(&self) -> bool {
        false
    }

    fn has_location_permission(&self) -> bool {
        true
    }
}

/// Read the first battery under a sysfs power-supply directory
fn read_battery(dir: &Path) -> BatteryState {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return BatteryState::default();
    };

    let mut saw_supply = false;
    for entry in entries.flatten() {
        saw_supply = true;
        let path = entry.path();
        let kind = std::fs::read_to_string(path.join("type")).unwrap_or_default();
        if kind.trim() != "Battery" {
            continue;
        }
        let percentage = std::fs::read_to_string(path.join("capacity"))
            .ok()
            .and_then(|c| c.trim().parse::<u8>().ok());
        return BatteryState {
            present: Some(true),
            percentage,
        };
    }

    BatteryState {
        present: saw_supply.then_some(false),
        percentage: None,
    }
}

/// Parse `nmcli -t -f BSSID,SSID,SIGNAL device wifi list`
///
/// Colons inside the BSSID are escaped as `\:` in terse mode.
fn parse_nmcli_wifi_list(out: &str) -> Vec<ScanResult> {
    out.lines()
        .filter_map(|line| {
            let unescaped = line.replace("\\:", "\u{1}");
            let mut fields = unescaped.split(':');
            let bssid = fields.next()?.replace('\u{1}', ":");
            let ssid = fields.next()?.replace('\u{1}', ":");
            let signal: i32 = fields.next()?.trim().parse().ok()?;
            if bssid.is_empty() {
                return None;
            }
            Some(ScanResult {
                bssid,
                ssid,
                // nmcli reports 0..=100 quality; map to a rough dBm
                level: signal / 2 - 100,
                trusted: true,
            })
        })
        .collect()
}
