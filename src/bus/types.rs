//! Action bus message types

use std::fmt;

use serde::Serialize;

/// Value of a named action parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

/// A named action parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
}

impl Param {
    #[must_use]
    pub fn new(name: &str, value: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// Speech priority, highest last
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechPriority {
    /// Background information
    Low,
    /// Replies to something the user asked for
    UserAction,
    /// Warnings and errors
    High,
}

impl SpeechPriority {
    const fn as_i64(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::UserAction => 1,
            Self::High => 2,
        }
    }
}

/// Microphone source for audio recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    /// Default microphone
    Mic,
    /// Source that is irrelevant (stop requests)
    Unspecified,
}

/// What the camera module is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraUsage {
    FlashlightOn,
    FlashlightOff,
    TakeRearPhoto,
    TakeFrontalPhoto,
}

impl CameraUsage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::FlashlightOn => "flashlight_on",
            Self::FlashlightOff => "flashlight_off",
            Self::TakeRearPhoto => "take_rear_photo",
            Self::TakeFrontalPhoto => "take_frontal_photo",
        }
    }
}

/// A message carried by the action bus
///
/// Each variant is one action with a fixed, ordered set of parameters.
/// Consumers must ignore actions they don't handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionMessage {
    /// Say something out loud
    Speak {
        text: String,
        priority: SpeechPriority,
        /// The speech is the whole effect of a command and must not be downgraded
        speak_only: bool,
    },
    /// Repeat the last thing said
    SayAgain,
    /// (Re)start the always-listening recognizer
    StartPassiveListening,
    /// Stop every active speech recognizer
    StopRecognition,
    /// Start or stop audio recording
    RecordAudio {
        start: bool,
        source: AudioSource,
        /// Restart passive listening once the recorder is done
        restart_recognition: bool,
    },
    /// Use the camera
    UseCamera { usage: CameraUsage },
    /// Vibrate the device once
    Vibrate { duration_ms: u64 },
    /// Run an utterance through the command executor
    ProcessUtterance {
        text: String,
        partial: bool,
        dry_run: bool,
    },
    /// Action owned by a module outside this crate
    Custom { id: String, params: Vec<Param> },
}

impl ActionMessage {
    pub const SPEAK: &'static str = "speech.speak";
    pub const SAY_AGAIN: &'static str = "speech.say_again";
    pub const START_PASSIVE_LISTENING: &'static str = "recognition.start_passive";
    pub const STOP_RECOGNITION: &'static str = "recognition.stop";
    pub const RECORD_AUDIO: &'static str = "recorder.record_audio";
    pub const USE_CAMERA: &'static str = "camera.use";
    pub const VIBRATE: &'static str = "haptics.vibrate";
    pub const PROCESS_UTTERANCE: &'static str = "executor.process_utterance";

    /// Speech reply to a user request
    #[must_use]
    pub fn speak(text: impl Into<String>, speak_only: bool) -> Self {
        Self::Speak {
            text: text.into(),
            priority: SpeechPriority::UserAction,
            speak_only,
        }
    }

    /// Namespaced action identifier
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Speak { .. } => Self::SPEAK,
            Self::SayAgain => Self::SAY_AGAIN,
            Self::StartPassiveListening => Self::START_PASSIVE_LISTENING,
            Self::StopRecognition => Self::STOP_RECOGNITION,
            Self::RecordAudio { .. } => Self::RECORD_AUDIO,
            Self::UseCamera { .. } => Self::USE_CAMERA,
            Self::Vibrate { .. } => Self::VIBRATE,
            Self::ProcessUtterance { .. } => Self::PROCESS_UTTERANCE,
            Self::Custom { id, .. } => id,
        }
    }

    /// Ordered named parameters, as agreed between producer and consumer
    #[must_use]
    pub fn params(&self) -> Vec<Param> {
        match self {
            Self::Speak {
                text,
                priority,
                speak_only,
            } => vec![
                Param::new("text", ParamValue::Str(text.clone())),
                Param::new("priority", ParamValue::Int(priority.as_i64())),
                Param::new("speak_only", ParamValue::Bool(*speak_only)),
            ],
            Self::SayAgain | Self::StartPassiveListening | Self::StopRecognition => Vec::new(),
            Self::RecordAudio {
                start,
                source,
                restart_recognition,
            } => vec![
                Param::new("start", ParamValue::Bool(*start)),
                Param::new(
                    "source",
                    ParamValue::Int(match source {
                        AudioSource::Mic => 1,
                        AudioSource::Unspecified => -1,
                    }),
                ),
                Param::new("restart_recognition", ParamValue::Bool(*restart_recognition)),
            ],
            Self::UseCamera { usage } => {
                vec![Param::new("usage", ParamValue::Str(usage.as_str().to_string()))]
            }
            Self::Vibrate { duration_ms } => vec![Param::new(
                "duration_ms",
                ParamValue::Int(i64::try_from(*duration_ms).unwrap_or(i64::MAX)),
            )],
            Self::ProcessUtterance {
                text,
                partial,
                dry_run,
            } => vec![
                Param::new("text", ParamValue::Str(text.clone())),
                Param::new("partial", ParamValue::Bool(*partial)),
                Param::new("dry_run", ParamValue::Bool(*dry_run)),
            ],
            Self::Custom { params, .. } => params.clone(),
        }
    }
}

impl fmt::Display for ActionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Selects which actions a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFilter {
    /// Every action
    All,
    /// Exact action identifiers
    Ids(Vec<String>),
    /// Every action under a namespace (e.g. `"speech"` matches `"speech.speak"`)
    Namespace(String),
}

impl ActionFilter {
    /// Filter for a single action identifier
    #[must_use]
    pub fn id(id: &str) -> Self {
        Self::Ids(vec![id.to_string()])
    }

    /// Filter for several action identifiers
    #[must_use]
    pub fn ids(ids: &[&str]) -> Self {
        Self::Ids(ids.iter().map(ToString::to_string).collect())
    }

    /// Filter for a namespace
    #[must_use]
    pub fn namespace(prefix: &str) -> Self {
        Self::Namespace(prefix.trim_end_matches('.').to_string())
    }

    /// Check whether an action identifier passes this filter
    #[must_use]
    pub fn matches(&self, action_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.iter().any(|id| id == action_id),
            Self::Namespace(prefix) => action_id
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('.')),
        }
    }
}
