//! Command dispatch engine
//!
//! Turns a recognized utterance into actions: the detection classifier splits
//! it into command codes, and each code runs its handler against a
//! per-invocation [`DispatchContext`].

mod code;
mod executor;
mod handlers;

pub use code::{
    CMDS_SEPARATOR, CommandCode, CommandId, Detection, ERR_CMD_DETECT, QUALIFIER_SEPARATOR, ret,
};
pub use executor::CommandExecutor;
pub use handlers::{CommandHandler, HandlerOutcome, default_handlers};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;

use crate::bus::{ActionBus, ActionMessage, SpeechPriority};
use crate::config::DispatchConfig;
use crate::modules::ModuleRegistry;
use crate::platform::Platform;

/// Registry id of the audio recorder module
pub const AUDIO_RECORDER_MODULE: &str = "audio_recorder";

const PREREQUISITE_MESSAGE: &str =
    "ATTENTION - Commands detection is not available. The detector executable was not found or failed \
     its integrity check.";

/// Result of processing one utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    NothingExecuted,
    SomethingExecuted,
    DetectionError,
    PrerequisiteUnavailable,
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NothingExecuted => "nothing executed",
            Self::SomethingExecuted => "something executed",
            Self::DetectionError => "detection error",
            Self::PrerequisiteUnavailable => "prerequisite unavailable",
        })
    }
}

/// State of a single `process_utterance` call
///
/// Created fresh for every call, so nothing leaks between utterances. In
/// dry-run mode every publish is swallowed.
pub struct DispatchContext<'a> {
    platform: &'a Platform,
    bus: &'a ActionBus,
    modules: Option<Arc<ModuleRegistry>>,
    partial: bool,
    dry_run: bool,
    speak_only: bool,
    detected: bool,
}

impl<'a> DispatchContext<'a> {
    fn new(
        platform: &'a Platform,
        bus: &'a ActionBus,
        modules: Option<Arc<ModuleRegistry>>,
        partial: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            platform,
            bus,
            modules,
            partial,
            dry_run,
            speak_only: false,
            detected: false,
        }
    }

    /// Mark a command as detected
    ///
    /// Returns whether the handler may go on to act, i.e. false in dry-run.
    pub fn detect(&mut self) -> bool {
        self.detected = true;
        !self.dry_run
    }

    /// Whether any handler detected a command so far
    #[must_use]
    pub const fn is_detected(&self) -> bool {
        self.detected
    }

    /// Whether the utterance is a partial recognition result
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.partial
    }

    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Whether the current command only produces speech
    #[must_use]
    pub const fn speak_only(&self) -> bool {
        self.speak_only
    }

    #[must_use]
    pub const fn platform(&self) -> &Platform {
        self.platform
    }

    /// Whether a registered module is currently supported
    ///
    /// Unknown modules and a missing registry count as unsupported.
    #[must_use]
    pub fn module_supported(&self, id: &str) -> bool {
        self.modules
            .as_ref()
            .and_then(|registry| registry.is_supported(id).ok())
            .unwrap_or(false)
    }

    /// Speak a response to the current command
    pub fn speak(&mut self, text: impl Into<String>) {
        let message = ActionMessage::speak(text, self.speak_only);
        self.publish(message);
    }

    /// Publish an action unless in dry-run
    pub fn publish(&mut self, message: ActionMessage) {
        if self.dry_run {
            tracing::trace!(action = %message, "dry run, not publishing");
            return;
        }
        self.bus.publish(message);
    }
}

impl fmt::Debug for DispatchContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("partial", &self.partial)
            .field("dry_run", &self.dry_run)
            .field("speak_only", &self.speak_only)
            .field("detected", &self.detected)
            .finish_non_exhaustive()
    }
}

/// Maps command codes to handlers and runs them
pub struct DispatchEngine {
    platform: Platform,
    bus: ActionBus,
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
    ack_vibration: Duration,
    modules: Weak<ModuleRegistry>,
}

impl DispatchEngine {
    /// Create an engine with the default handler table
    #[must_use]
    pub fn new(platform: Platform, bus: ActionBus, config: &DispatchConfig) -> Self {
        Self {
            platform,
            bus,
            handlers: default_handlers(),
            ack_vibration: config.ack_vibration,
            modules: Weak::new(),
        }
    }

    /// Let handlers query module support
    #[must_use]
    pub fn with_modules(mut self, modules: Weak<ModuleRegistry>) -> Self {
        self.modules = modules;
        self
    }

    /// Replace the handler for a command
    pub fn set_handler(&mut self, id: CommandId, handler: Box<dyn CommandHandler>) {
        self.handlers.insert(id.as_str(), handler);
    }

    /// Number of commands with a handler
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub const fn bus(&self) -> &ActionBus {
        &self.bus
    }

    /// Detect and run the commands in an utterance
    ///
    /// With `dry_run` nothing is published; the return value tells whether
    /// anything would have happened.
    pub fn process_utterance(&self, text: &str, partial: bool, dry_run: bool) -> DispatchOutcome {
        if !self.platform.detector.is_available() {
            tracing::warn!("command detection unavailable");
            if !dry_run {
                self.bus.publish(ActionMessage::speak(PREREQUISITE_MESSAGE, false));
            }
            return DispatchOutcome::PrerequisiteUnavailable;
        }

        let raw = match self.platform.detector.detect(text) {
            Ok(raw) => raw,
            Err(e) => format!("{ERR_CMD_DETECT}: {e}"),
        };
        tracing::debug!(utterance = text, detected = %raw, partial, dry_run, "commands detected");

        let codes = match Detection::parse(&raw) {
            Detection::Error(diagnostic) => {
                tracing::warn!(utterance = text, %diagnostic, "command detection failed");
                if !dry_run {
                    // Restart passive listening first so the warning is not heard as a new utterance
                    self.bus.publish(ActionMessage::StartPassiveListening);
                    self.bus.publish(ActionMessage::Speak {
                        text: format!(
                            "WARNING! There was a problem processing the commands sir. Please fix this. \
                             The error was the following: {diagnostic}. You said: {text}"
                        ),
                        priority: SpeechPriority::High,
                        speak_only: false,
                    });
                }
                return DispatchOutcome::DetectionError;
            }
            Detection::Commands(codes) => codes,
        };

        let mut ctx = DispatchContext::new(
            &self.platform,
            &self.bus,
            self.modules.upgrade(),
            partial,
            dry_run,
        );

        for code in &codes {
            let Some(handler) = self.handlers.get(code.primary()) else {
                tracing::debug!(token = %code, "no handler for command");
                continue;
            };
            ctx.speak_only = code.id().is_some_and(CommandId::is_speak_only);
            let outcome = handler.handle(code, &mut ctx);
            tracing::debug!(token = %code, ?outcome, "command handled");
        }

        if ctx.is_detected() {
            let duration_ms = u64::try_from(self.ack_vibration.as_millis()).unwrap_or(u64::MAX);
            ctx.publish(ActionMessage::Vibrate { duration_ms });
            DispatchOutcome::SomethingExecuted
        } else {
            DispatchOutcome::NothingExecuted
        }
    }
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("handlers", &self.handlers.len())
            .field("ack_vibration", &self.ack_vibration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::bus::ActionFilter;
    use crate::platform::{
        ActionResult, BatteryState, Clock, CommandDetector, Connectivity, DeviceState, MediaKey,
        MediaSession, PowerControl, Radio, RebootMode, Telephony,
    };
    use crate::{Error, Result};

    struct Scripted {
        available: bool,
        reply: Result<String>,
    }

    impl CommandDetector for Scripted {
        fn is_available(&self) -> bool {
            self.available
        }

        fn detect(&self, _utterance: &str) -> Result<String> {
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(Error::Detection(e.to_string())),
            }
        }
    }

    #[derive(Default)]
    struct Hardware {
        radios: Mutex<Vec<(Radio, bool)>>,
        result: Option<ActionResult>,
    }

    impl Connectivity for Hardware {
        fn set_radio(&self, radio: Radio, enabled: bool) -> ActionResult {
            self.radios.lock().unwrap().push((radio, enabled));
            self.result.unwrap_or(ActionResult::Ok)
        }
    }

    impl PowerControl for Hardware {
        fn shut_down(&self) -> ActionResult {
            ActionResult::PermissionDenied
        }

        fn reboot(&self, _mode: RebootMode) -> ActionResult {
            ActionResult::Ok
        }

        fn set_battery_saver(&self, _enabled: bool) -> ActionResult {
            ActionResult::Ok
        }

        fn battery_saver_enabled(&self) -> bool {
            false
        }
    }

    impl Telephony for Hardware {
        fn answer_call(&self) -> ActionResult {
            ActionResult::Ok
        }

        fn end_call(&self) -> ActionResult {
            ActionResult::Ok
        }

        fn set_speakerphone(&self, _enabled: bool) -> ActionResult {
            ActionResult::Ok
        }
    }

    impl MediaSession for Hardware {
        fn is_playing(&self) -> bool {
            false
        }

        fn send_key(&self, _key: MediaKey) -> ActionResult {
            ActionResult::Ok
        }
    }

    impl DeviceState for Hardware {
        fn battery(&self) -> BatteryState {
            BatteryState {
                present: Some(true),
                percentage: Some(80),
            }
        }
    }

    impl Clock for Hardware {
        fn time_string(&self) -> String {
            "14:05".to_string()
        }

        fn date_string(&self) -> String {
            "Saturday, October 17, 2026".to_string()
        }
    }

    fn engine(detector: Scripted, hardware: Arc<Hardware>) -> DispatchEngine {
        let platform = Platform {
            detector: Arc::new(detector),
            connectivity: hardware.clone(),
            power: hardware.clone(),
            telephony: hardware.clone(),
            media: hardware.clone(),
            device: hardware.clone(),
            clock: hardware,
        };
        DispatchEngine::new(platform, ActionBus::new(), &DispatchConfig::default())
    }

    fn replying(reply: &str) -> Scripted {
        Scripted {
            available: true,
            reply: Ok(reply.to_string()),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ActionMessage>) -> Vec<ActionMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn spoken(messages: &[ActionMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                ActionMessage::Speak { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn nothing_detected_publishes_nothing() {
        let engine = engine(replying("garbage|  |"), Arc::default());
        let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

        assert_eq!(
            engine.process_utterance("hmm", false, false),
            DispatchOutcome::NothingExecuted
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn ask_time_speaks_and_acknowledges() {
        let engine = engine(replying("2"), Arc::default());
        let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

        assert_eq!(
            engine.process_utterance("what time is it", false, false),
            DispatchOutcome::SomethingExecuted
        );

        let messages = drain(&mut rx);
        assert_eq!(
            messages,
            vec![
                ActionMessage::speak("It's 14:05", true),
                ActionMessage::Vibrate { duration_ms: 200 },
            ]
        );
    }

    #[test]
    fn toggle_follows_on_qualifier() {
        let hardware = Arc::new(Hardware::default());
        let engine = engine(replying("7.RET_ON|7.RET_OFF|7"), hardware.clone());

        engine.process_utterance("airplane", false, false);
        assert_eq!(
            *hardware.radios.lock().unwrap(),
            vec![
                (Radio::AirplaneMode, true),
                (Radio::AirplaneMode, false),
                (Radio::AirplaneMode, false),
            ]
        );
    }

    #[test]
    fn dry_run_has_no_side_effects() {
        let hardware = Arc::new(Hardware::default());
        let engine = engine(replying("4.RET_ON|11"), hardware.clone());
        let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

        for _ in 0..2 {
            assert_eq!(
                engine.process_utterance("wifi on and battery", false, true),
                DispatchOutcome::SomethingExecuted
            );
        }
        assert!(drain(&mut rx).is_empty());
        assert!(hardware.radios.lock().unwrap().is_empty());
    }

    #[test]
    fn detection_error_restarts_listening_once() {
        let engine = engine(replying("ERR_CMD_DETECT - bad"), Arc::default());
        let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

        assert_eq!(
            engine.process_utterance("blah", false, false),
            DispatchOutcome::DetectionError
        );

        let messages = drain(&mut rx);
        let restarts = messages
            .iter()
            .filter(|m| **m == ActionMessage::StartPassiveListening)
            .count();
        assert_eq!(restarts, 1);
        assert_eq!(messages[0], ActionMessage::StartPassiveListening);
        let text = &spoken(&messages)[0];
        assert!(text.contains("ERR_CMD_DETECT - bad"));
        assert!(text.ends_with("You said: blah"));
    }

    #[test]
    fn detector_failure_counts_as_detection_error() {
        let engine = engine(
            Scripted {
                available: true,
                reply: Err(Error::Detection("crashed".to_string())),
            },
            Arc::default(),
        );
        assert_eq!(
            engine.process_utterance("blah", false, false),
            DispatchOutcome::DetectionError
        );
    }

    #[test]
    fn unavailable_detector_short_circuits() {
        let engine = engine(
            Scripted {
                available: false,
                reply: Ok("2".to_string()),
            },
            Arc::default(),
        );
        let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

        assert_eq!(
            engine.process_utterance("what time is it", false, false),
            DispatchOutcome::PrerequisiteUnavailable
        );
        let said = spoken(&drain(&mut rx));
        assert_eq!(said.len(), 1);
        assert!(said[0].starts_with("ATTENTION"));
    }

    #[test]
    fn detected_flag_does_not_leak_between_calls() {
        let engine = engine(replying("2"), Arc::default());
        assert_eq!(
            engine.process_utterance("time", false, true),
            DispatchOutcome::SomethingExecuted
        );

        let mut engine = engine;
        struct Ignore;
        impl CommandHandler for Ignore {
            fn handle(&self, _code: &CommandCode, _ctx: &mut DispatchContext<'_>) -> HandlerOutcome {
                HandlerOutcome::NotDetected
            }
        }
        engine.set_handler(CommandId::AskTime, Box::new(Ignore));
        assert_eq!(
            engine.process_utterance("time", false, true),
            DispatchOutcome::NothingExecuted
        );
    }

    #[test]
    fn every_command_has_a_handler() {
        let engine = engine(replying(""), Arc::default());
        assert_eq!(engine.handler_count(), CommandId::ALL.len());
    }
}
