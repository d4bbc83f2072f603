//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use visor_assistant::bus::ActionMessage;
use visor_assistant::platform::{
    ActionResult, BatteryState, Clock, CommandDetector, Connectivity, DeviceState, MediaKey,
    MediaSession, PowerControl, Radio, RebootMode, Telephony,
};
use visor_assistant::{Error, Platform, Result};

/// Detector returning a fixed reply and recording what it was asked
pub struct ScriptedDetector {
    pub available: bool,
    pub reply: std::result::Result<String, String>,
    pub seen: Mutex<Vec<String>>,
}

impl ScriptedDetector {
    #[must_use]
    pub fn replying(reply: &str) -> Self {
        Self {
            available: true,
            reply: Ok(reply.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::replying("")
        }
    }

    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            ..Self::replying("")
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl CommandDetector for ScriptedDetector {
    fn is_available(&self) -> bool {
        self.available
    }

    fn detect(&self, utterance: &str) -> Result<String> {
        self.seen.lock().unwrap().push(utterance.to_string());
        self.reply.clone().map_err(Error::Detection)
    }
}

/// Device fake recording every hardware call
pub struct FakeDevice {
    pub calls: Mutex<Vec<String>>,
    pub radio_result: ActionResult,
    pub battery: BatteryState,
    pub playing: bool,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            radio_result: ActionResult::Ok,
            battery: BatteryState {
                present: Some(true),
                percentage: Some(73),
            },
            playing: false,
        }
    }
}

impl FakeDevice {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Connectivity for FakeDevice {
    fn set_radio(&self, radio: Radio, enabled: bool) -> ActionResult {
        self.record(format!("radio {radio:?} {enabled}"));
        self.radio_result
    }
}

impl PowerControl for FakeDevice {
    fn shut_down(&self) -> ActionResult {
        self.record("shut_down".to_string());
        ActionResult::PermissionDenied
    }

    fn reboot(&self, mode: RebootMode) -> ActionResult {
        self.record(format!("reboot {mode:?}"));
        ActionResult::Ok
    }

    fn set_battery_saver(&self, enabled: bool) -> ActionResult {
        self.record(format!("battery_saver {enabled}"));
        ActionResult::Ok
    }

    fn battery_saver_enabled(&self) -> bool {
        false
    }
}

impl Telephony for FakeDevice {
    fn answer_call(&self) -> ActionResult {
        self.record("answer_call".to_string());
        ActionResult::GeneralError
    }

    fn end_call(&self) -> ActionResult {
        self.record("end_call".to_string());
        ActionResult::Ok
    }

    fn set_speakerphone(&self, enabled: bool) -> ActionResult {
        self.record(format!("speakerphone {enabled}"));
        ActionResult::Ok
    }
}

impl MediaSession for FakeDevice {
    fn is_playing(&self) -> bool {
        self.playing
    }

    fn send_key(&self, key: MediaKey) -> ActionResult {
        self.record(format!("media {key:?}"));
        ActionResult::Ok
    }
}

impl DeviceState for FakeDevice {
    fn battery(&self) -> BatteryState {
        self.battery
    }
}

impl Clock for FakeDevice {
    fn time_string(&self) -> String {
        "09:30".to_string()
    }

    fn date_string(&self) -> String {
        "Saturday, October 17, 2026".to_string()
    }
}

/// Build a platform from a detector and a device fake
pub fn platform(detector: Arc<ScriptedDetector>, device: Arc<FakeDevice>) -> Platform {
    Platform {
        detector,
        connectivity: device.clone(),
        power: device.clone(),
        telephony: device.clone(),
        media: device.clone(),
        device: device.clone(),
        clock: device,
    }
}

/// Everything queued on a receiver so far
pub fn drain(rx: &mut UnboundedReceiver<ActionMessage>) -> Vec<ActionMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

/// Texts of the speech actions among `messages`
pub fn spoken(messages: &[ActionMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ActionMessage::Speak { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
