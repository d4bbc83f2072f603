//! Command codes produced by the detection classifier
//!
//! The classifier output is either an error marker followed by a diagnostic,
//! or tokens joined by [`CMDS_SEPARATOR`]. Each token is
//! `<primary>[.<qualifier>]*`; qualifiers are matched by containment since one
//! token can pack several facts.

use std::fmt;

/// Separator between command tokens
pub const CMDS_SEPARATOR: &str = "|";

/// Separator between a primary id and its qualifiers
pub const QUALIFIER_SEPARATOR: char = '.';

/// Prefix of a classifier error
pub const ERR_CMD_DETECT: &str = "ERR_CMD_DETECT";

/// Return qualifiers
pub mod ret {
    pub const ON: &str = "RET_ON";
    pub const OFF: &str = "RET_OFF";

    pub const REBOOT_NORMAL: &str = "RET_14_NORMAL";
    pub const REBOOT_SAFE_MODE: &str = "RET_14_SAFE_MODE";
    pub const REBOOT_RECOVERY: &str = "RET_14_RECOVERY";
    pub const REBOOT_BOOTLOADER: &str = "RET_14_BOOTLOADER";
    pub const REBOOT_FAST: &str = "RET_14_FAST";

    pub const PHOTO_REAR: &str = "RET_15_REAR";
    pub const PHOTO_FRONTAL: &str = "RET_15_FRONTAL";

    pub const RECORD_AUDIO: &str = "RET_16_AUDIO";
    pub const RECORD_VIDEO_REAR: &str = "RET_16_VIDEO_REAR";
    pub const RECORD_VIDEO_FRONTAL: &str = "RET_16_VIDEO_FRONTAL";

    pub const STOP_AUDIO: &str = "RET_20_AUDIO";
    pub const STOP_VIDEO: &str = "RET_20_VIDEO";
    pub const STOP_ANY: &str = "RET_20_ANY";
}

/// Primary command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    ToggleFlashlight,
    AskTime,
    AskDate,
    ToggleWifi,
    ToggleMobileData,
    ToggleBluetooth,
    ToggleAirplaneMode,
    AnswerCall,
    EndCall,
    ToggleSpeakerphone,
    AskBatteryPercent,
    ShutDown,
    ToggleBatterySaver,
    Reboot,
    TakePhoto,
    RecordMedia,
    SayAgain,
    StopRecordMedia,
    MediaStop,
    MediaPause,
    MediaPlay,
    MediaNext,
    MediaPrevious,
}

impl CommandId {
    /// Every known command, in id order
    pub const ALL: [Self; 23] = [
        Self::ToggleFlashlight,
        Self::AskTime,
        Self::AskDate,
        Self::ToggleWifi,
        Self::ToggleMobileData,
        Self::ToggleBluetooth,
        Self::ToggleAirplaneMode,
        Self::AnswerCall,
        Self::EndCall,
        Self::ToggleSpeakerphone,
        Self::AskBatteryPercent,
        Self::ShutDown,
        Self::ToggleBatterySaver,
        Self::Reboot,
        Self::TakePhoto,
        Self::RecordMedia,
        Self::SayAgain,
        Self::StopRecordMedia,
        Self::MediaStop,
        Self::MediaPause,
        Self::MediaPlay,
        Self::MediaNext,
        Self::MediaPrevious,
    ];

    /// Primary id as it appears in a token
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToggleFlashlight => "1",
            Self::AskTime => "2",
            Self::AskDate => "3",
            Self::ToggleWifi => "4",
            Self::ToggleMobileData => "5",
            Self::ToggleBluetooth => "6",
            Self::ToggleAirplaneMode => "7",
            Self::AnswerCall => "8",
            Self::EndCall => "9",
            Self::ToggleSpeakerphone => "10",
            Self::AskBatteryPercent => "11",
            Self::ShutDown => "12",
            Self::ToggleBatterySaver => "13",
            Self::Reboot => "14",
            Self::TakePhoto => "15",
            Self::RecordMedia => "16",
            Self::SayAgain => "17",
            Self::StopRecordMedia => "20",
            Self::MediaStop => "21",
            Self::MediaPause => "22",
            Self::MediaPlay => "23",
            Self::MediaNext => "24",
            Self::MediaPrevious => "25",
        }
    }

    /// Look up a primary id
    #[must_use]
    pub fn from_primary(primary: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == primary)
    }

    /// Commands whose whole effect is a spoken answer
    #[must_use]
    pub const fn is_speak_only(self) -> bool {
        matches!(
            self,
            Self::AskTime | Self::AskDate | Self::AskBatteryPercent | Self::SayAgain
        )
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCode {
    token: String,
}

impl CommandCode {
    /// Wrap a token; blank tokens yield `None`
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        (!token.is_empty()).then(|| Self {
            token: token.to_string(),
        })
    }

    /// Substring before the first qualifier separator
    ///
    /// A token without separator is its own primary id.
    #[must_use]
    pub fn primary(&self) -> &str {
        self.token
            .split(QUALIFIER_SEPARATOR)
            .next()
            .unwrap_or(&self.token)
    }

    /// Known command for the primary id
    #[must_use]
    pub fn id(&self) -> Option<CommandId> {
        CommandId::from_primary(self.primary())
    }

    /// Whether the token carries a qualifier
    #[must_use]
    pub fn has(&self, qualifier: &str) -> bool {
        self.token.contains(qualifier)
    }

    /// Whether the token asks for the "on" branch of a toggle
    #[must_use]
    pub fn wants_on(&self) -> bool {
        self.has(ret::ON)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// Parsed classifier output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The classifier failed; carries the full diagnostic
    Error(String),
    /// Command codes in utterance order
    Commands(Vec<CommandCode>),
}

impl Detection {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with(ERR_CMD_DETECT) {
            return Self::Error(raw.to_string());
        }
        Self::Commands(
            raw.split(CMDS_SEPARATOR)
                .filter_map(CommandCode::parse)
                .collect(),
        )
    }
}
