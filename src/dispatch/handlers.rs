//! Per-command handlers
//!
//! A handler marks its command detected, bails out in dry-run, performs the
//! action and turns the result into speech. Every result code ends in some
//! spoken response.

use std::collections::HashMap;

use super::code::{CommandCode, CommandId, ret};
use super::{AUDIO_RECORDER_MODULE, DispatchContext};
use crate::bus::{ActionMessage, AudioSource, CameraUsage};
use crate::platform::{ActionResult, MediaKey, Radio, RebootMode};

/// What a handler did with its command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The command did not apply, e.g. a partial result
    NotDetected,
    /// Detected but not acted upon
    DryRun,
    /// The action was carried out
    Performed,
    /// A qualifier was missing and a clarification was asked for
    Unclear,
    /// The action reported a failure, which was spoken
    Failed(ActionResult),
}

/// Handler for one primary command id
pub trait CommandHandler: Send + Sync {
    fn handle(&self, code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome;
}

/// Handler table for every known command
#[must_use]
pub fn default_handlers() -> HashMap<&'static str, Box<dyn CommandHandler>> {
    CommandId::ALL
        .into_iter()
        .map(|id| (id.as_str(), handler_for(id)))
        .collect()
}

fn handler_for(id: CommandId) -> Box<dyn CommandHandler> {
    match id {
        CommandId::ToggleFlashlight => Box::new(Flashlight),
        CommandId::AskTime => Box::new(AskTime),
        CommandId::AskDate => Box::new(AskDate),
        CommandId::ToggleWifi => Box::new(Toggle::radio(Radio::Wifi, "Wi-Fi", None)),
        CommandId::ToggleMobileData => {
            Box::new(Toggle::radio(Radio::MobileData, "mobile data", None))
        }
        CommandId::ToggleBluetooth => {
            Box::new(Toggle::radio(Radio::Bluetooth, "Bluetooth", Some("Bluetooth")))
        }
        CommandId::ToggleAirplaneMode => {
            Box::new(Toggle::radio(Radio::AirplaneMode, "airplane mode", None))
        }
        CommandId::AnswerCall => Box::new(Call { answer: true }),
        CommandId::EndCall => Box::new(Call { answer: false }),
        CommandId::ToggleSpeakerphone => Box::new(Toggle {
            target: ToggleTarget::Speakerphone,
            label: "speakerphone",
            adapter: None,
        }),
        CommandId::AskBatteryPercent => Box::new(BatteryPercent),
        CommandId::ShutDown => Box::new(ShutDown),
        CommandId::ToggleBatterySaver => Box::new(Toggle {
            target: ToggleTarget::BatterySaver,
            label: "battery saver mode",
            adapter: None,
        }),
        CommandId::Reboot => Box::new(Reboot),
        CommandId::TakePhoto => Box::new(TakePhoto),
        CommandId::RecordMedia => Box::new(RecordMedia),
        CommandId::SayAgain => Box::new(SayAgain),
        CommandId::StopRecordMedia => Box::new(StopRecordMedia),
        CommandId::MediaStop => Box::new(Media(MediaKey::Stop)),
        CommandId::MediaPause => Box::new(Media(MediaKey::Pause)),
        CommandId::MediaPlay => Box::new(Media(MediaKey::Play)),
        CommandId::MediaNext => Box::new(Media(MediaKey::Next)),
        CommandId::MediaPrevious => Box::new(Media(MediaKey::Previous)),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

struct Flashlight;

impl CommandHandler for Flashlight {
    fn handle(&self, code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }
        let usage = if code.wants_on() {
            CameraUsage::FlashlightOn
        } else {
            CameraUsage::FlashlightOff
        };
        ctx.publish(ActionMessage::UseCamera { usage });
        HandlerOutcome::Performed
    }
}

struct AskTime;

impl CommandHandler for AskTime {
    fn handle(&self, _code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }
        let time = ctx.platform().clock.time_string();
        ctx.speak(format!("It's {time}"));
        HandlerOutcome::Performed
    }
}

struct AskDate;

impl CommandHandler for AskDate {
    fn handle(&self, _code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }
        let date = ctx.platform().clock.date_string();
        ctx.speak(format!("Today's {date}"));
        HandlerOutcome::Performed
    }
}

#[derive(Debug, Clone, Copy)]
enum ToggleTarget {
    Radio(Radio),
    BatterySaver,
    Speakerphone,
}

/// On/off switch driven by `RET_ON`
struct Toggle {
    target: ToggleTarget,
    label: &'static str,
    /// Hardware named when the adapter is missing
    adapter: Option<&'static str>,
}

impl Toggle {
    const fn radio(radio: Radio, label: &'static str, adapter: Option<&'static str>) -> Self {
        Self {
            target: ToggleTarget::Radio(radio),
            label,
            adapter,
        }
    }

    fn response(&self, result: ActionResult) -> String {
        let label = self.label;
        match result {
            ActionResult::Ok => format!("{} toggled.", capitalize(label)),
            ActionResult::PermissionDenied => format!("No permission to toggle the {label}."),
            ActionResult::AlreadyEnabled => format!("The {label} is already enabled."),
            ActionResult::AlreadyEnabling => format!("The {label} is already being enabled."),
            ActionResult::AlreadyDisabled => format!("The {label} is already disabled."),
            ActionResult::AlreadyDisabling => format!("The {label} is already being disabled."),
            ActionResult::NoAdapter => match self.adapter {
                Some(adapter) => format!("The device does not feature a {adapter} adapter."),
                None => format!("The device does not support the {label}."),
            },
            ActionResult::GeneralError => format!("Error toggling the {label}."),
            ActionResult::Unsupported => {
                format!("Toggling the {label} is not supported on this device.")
            }
            ActionResult::Other(_) => format!("Unspecified error toggling the {label}."),
        }
    }
}

impl CommandHandler for Toggle {
    fn handle(&self, code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }

        let enable = code.wants_on();
        let platform = ctx.platform();
        let result = match self.target {
            ToggleTarget::Radio(radio) => platform.connectivity.set_radio(radio, enable),
            ToggleTarget::BatterySaver => platform.power.set_battery_saver(enable),
            ToggleTarget::Speakerphone => platform.telephony.set_speakerphone(enable),
        };
        tracing::debug!(toggle = ?self.target, enable, ?result, "toggle");

        ctx.speak(self.response(result));
        if result.is_ok() {
            HandlerOutcome::Performed
        } else {
            HandlerOutcome::Failed(result)
        }
    }
}

struct Call {
    answer: bool,
}

impl CommandHandler for Call {
    fn handle(&self, _code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }

        let telephony = &ctx.platform().telephony;
        let (result, verb, gerund, done) = if self.answer {
            (telephony.answer_call(), "answer", "answering", "Call answered.")
        } else {
            (telephony.end_call(), "end", "ending", "Call ended.")
        };

        let response = match result {
            ActionResult::Ok => done.to_string(),
            ActionResult::GeneralError => format!("Error {gerund} the call."),
            ActionResult::PermissionDenied => format!("No permission to {verb} the call."),
            ActionResult::Unsupported => "Call control is not available on this device.".to_string(),
            _ => format!("Unspecified error {gerund} the call."),
        };
        ctx.speak(response);

        if result.is_ok() {
            HandlerOutcome::Performed
        } else {
            HandlerOutcome::Failed(result)
        }
    }
}

struct BatteryPercent;

impl CommandHandler for BatteryPercent {
    fn handle(&self, _code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }

        let battery = ctx.platform().device.battery();
        if battery.present == Some(false) {
            ctx.speak("There is no battery present on the device.");
        }
        match battery.percentage {
            Some(percentage) => ctx.speak(format!("Battery percentage: {percentage}%.")),
            None => ctx.speak("Battery percentage not available yet."),
        }
        HandlerOutcome::Performed
    }
}

struct ShutDown;

impl CommandHandler for ShutDown {
    fn handle(&self, _code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }

        let result = ctx.platform().power.shut_down();
        ctx.speak(match result {
            ActionResult::Ok => "Shutting down the device...",
            ActionResult::PermissionDenied => "No permission to shut down the device.",
            ActionResult::Unsupported => "Shutting down is not supported on this device.",
            _ => "Unspecified error shutting down the device.",
        });
        if result.is_ok() {
            HandlerOutcome::Performed
        } else {
            HandlerOutcome::Failed(result)
        }
    }
}

struct Reboot;

impl Reboot {
    fn mode(code: &CommandCode) -> Option<RebootMode> {
        [
            (ret::REBOOT_NORMAL, RebootMode::Normal),
            (ret::REBOOT_SAFE_MODE, RebootMode::Safe),
            (ret::REBOOT_RECOVERY, RebootMode::Recovery),
            (ret::REBOOT_BOOTLOADER, RebootMode::Bootloader),
            (ret::REBOOT_FAST, RebootMode::Fast),
        ]
        .into_iter()
        .find_map(|(qualifier, mode)| code.has(qualifier).then_some(mode))
    }
}

impl CommandHandler for Reboot {
    fn handle(&self, code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }

        let Some(mode) = Self::mode(code) else {
            ctx.speak("Reboot how, sir? Normally, to safe mode, to recovery, to the bootloader or fast?");
            return HandlerOutcome::Unclear;
        };

        let result = ctx.platform().power.reboot(mode);
        ctx.speak(match result {
            ActionResult::Ok => "Rebooting the device...",
            ActionResult::PermissionDenied => "No permission to reboot the device.",
            ActionResult::Unsupported => "That reboot mode is not supported on this device.",
            _ => "Unspecified error rebooting the device.",
        });
        if result.is_ok() {
            HandlerOutcome::Performed
        } else {
            HandlerOutcome::Failed(result)
        }
    }
}

struct TakePhoto;

impl CommandHandler for TakePhoto {
    fn handle(&self, code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }
        let usage = if code.has(ret::PHOTO_REAR) {
            CameraUsage::TakeRearPhoto
        } else {
            CameraUsage::TakeFrontalPhoto
        };
        ctx.publish(ActionMessage::UseCamera { usage });
        HandlerOutcome::Performed
    }
}

struct RecordMedia;

impl CommandHandler for RecordMedia {
    fn handle(&self, code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if code.has(ret::RECORD_AUDIO) {
            // Starting now would cut off whatever the user is still saying
            if ctx.is_partial() {
                return HandlerOutcome::NotDetected;
            }
            if !ctx.detect() {
                return HandlerOutcome::DryRun;
            }
            if !ctx.module_supported(AUDIO_RECORDER_MODULE) {
                ctx.speak(
                    "Audio recording is not supported on this device through either hardware or \
                     application permissions limitations.",
                );
                return HandlerOutcome::Failed(ActionResult::Unsupported);
            }
            ctx.publish(ActionMessage::StopRecognition);
            ctx.publish(ActionMessage::RecordAudio {
                start: true,
                source: AudioSource::Mic,
                restart_recognition: false,
            });
            return HandlerOutcome::Performed;
        }

        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }
        if code.has(ret::RECORD_VIDEO_REAR) || code.has(ret::RECORD_VIDEO_FRONTAL) {
            ctx.speak("Video recording is not supported yet.");
            return HandlerOutcome::Failed(ActionResult::Unsupported);
        }
        ctx.speak("Record what, sir? Audio or video?");
        HandlerOutcome::Unclear
    }
}

struct SayAgain;

impl CommandHandler for SayAgain {
    fn handle(&self, _code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }
        ctx.publish(ActionMessage::SayAgain);
        HandlerOutcome::Performed
    }
}

struct StopRecordMedia;

impl CommandHandler for StopRecordMedia {
    fn handle(&self, code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }

        // "any" stops every kind, not just the first one matched
        let (audio, video) = if code.has(ret::STOP_AUDIO) {
            (true, false)
        } else if code.has(ret::STOP_VIDEO) {
            (false, true)
        } else if code.has(ret::STOP_ANY) {
            (true, true)
        } else {
            ctx.speak("Stop recording what, sir? Audio or video?");
            return HandlerOutcome::Unclear;
        };

        if audio {
            ctx.publish(ActionMessage::RecordAudio {
                start: false,
                source: AudioSource::Unspecified,
                restart_recognition: true,
            });
        }
        if video && !audio {
            ctx.speak("Video recording is not supported yet.");
            return HandlerOutcome::Failed(ActionResult::Unsupported);
        }
        HandlerOutcome::Performed
    }
}

struct Media(MediaKey);

impl Media {
    fn press(ctx: &mut DispatchContext<'_>, key: MediaKey) -> HandlerOutcome {
        let result = ctx.platform().media.send_key(key);
        match result {
            ActionResult::Ok => HandlerOutcome::Performed,
            ActionResult::Unsupported => {
                ctx.speak("Media control is not available.");
                HandlerOutcome::Failed(result)
            }
            _ => {
                ctx.speak("Unspecified error controlling the media.");
                HandlerOutcome::Failed(result)
            }
        }
    }
}

impl CommandHandler for Media {
    fn handle(&self, _code: &CommandCode, ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
        if !ctx.detect() {
            return HandlerOutcome::DryRun;
        }

        let key = self.0;
        let playing = ctx.platform().media.is_playing();
        match key {
            MediaKey::Stop | MediaKey::Pause if !playing => {
                ctx.speak(if key == MediaKey::Stop {
                    "Already stopped sir."
                } else {
                    "Already paused sir."
                });
                HandlerOutcome::Performed
            }
            MediaKey::Play if playing => {
                ctx.speak("Already playing sir.");
                HandlerOutcome::Performed
            }
            MediaKey::Next => {
                ctx.speak("Next one sir.");
                Self::press(ctx, key)
            }
            MediaKey::Previous => {
                ctx.speak("Previous one sir.");
                Self::press(ctx, key)
            }
            _ => Self::press(ctx, key),
        }
    }
}
