//! Command dispatch integration tests
//!
//! Runs utterances through the engine with fake collaborators and checks what
//! reaches the bus and the device.

use std::sync::Arc;

use visor_assistant::bus::{ActionFilter, AudioSource, CameraUsage, SpeechPriority};
use visor_assistant::config::DispatchConfig;
use visor_assistant::dispatch::AUDIO_RECORDER_MODULE;
use visor_assistant::modules::{Module, ModuleDescriptor, ModuleKind, ModuleRegistry};
use visor_assistant::platform::ActionResult;
use visor_assistant::{ActionBus, ActionMessage, DispatchEngine, DispatchOutcome, Result};

mod common;

use common::{FakeDevice, ScriptedDetector, drain, platform, spoken};

fn engine(detector: ScriptedDetector, device: Arc<FakeDevice>) -> DispatchEngine {
    DispatchEngine::new(
        platform(Arc::new(detector), device),
        ActionBus::new(),
        &DispatchConfig::default(),
    )
}

#[test]
fn test_what_time_is_it() {
    let engine = engine(ScriptedDetector::replying("2"), Arc::default());
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    let outcome = engine.process_utterance("what time is it", false, false);
    assert_eq!(outcome, DispatchOutcome::SomethingExecuted);

    let messages = drain(&mut rx);
    assert_eq!(spoken(&messages), vec!["It's 09:30"]);
    assert!(matches!(
        &messages[0],
        ActionMessage::Speak { speak_only: true, priority: SpeechPriority::UserAction, .. }
    ));
}

#[test]
fn test_wifi_and_battery_in_one_utterance() {
    let device = Arc::new(FakeDevice::default());
    let engine = engine(ScriptedDetector::replying("4.RET_ON|11"), device.clone());
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    let outcome = engine.process_utterance("turn on the wifi and tell me the battery", false, false);
    assert_eq!(outcome, DispatchOutcome::SomethingExecuted);

    let messages = drain(&mut rx);
    assert_eq!(
        spoken(&messages),
        vec!["Wi-Fi toggled.", "Battery percentage: 73%."]
    );
    // One acknowledgment for the whole utterance
    let acks = messages
        .iter()
        .filter(|m| matches!(m, ActionMessage::Vibrate { .. }))
        .count();
    assert_eq!(acks, 1);
    assert_eq!(device.calls(), vec!["radio Wifi true"]);
}

#[test]
fn test_airplane_mode_branches() {
    let device = Arc::new(FakeDevice::default());
    let engine = engine(
        ScriptedDetector::replying("7.RET_ON|7.RET_OFF|7"),
        device.clone(),
    );

    engine.process_utterance("airplane mode", false, false);
    assert_eq!(
        device.calls(),
        vec![
            "radio AirplaneMode true",
            "radio AirplaneMode false",
            "radio AirplaneMode false",
        ]
    );
}

#[test]
fn test_toggle_failure_is_spoken() {
    let device = Arc::new(FakeDevice {
        radio_result: ActionResult::NoAdapter,
        ..FakeDevice::default()
    });
    let engine = engine(ScriptedDetector::replying("6.RET_ON|4.RET_OFF"), device);
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    engine.process_utterance("bluetooth on, wifi off", false, false);
    assert_eq!(
        spoken(&drain(&mut rx)),
        vec![
            "The device does not feature a Bluetooth adapter.",
            "The device does not support the Wi-Fi.",
        ]
    );
}

#[test]
fn test_dry_run_is_idempotent_and_silent() {
    let device = Arc::new(FakeDevice::default());
    let engine = engine(
        ScriptedDetector::replying("1.RET_ON|12|20.RET_20_ANY"),
        device.clone(),
    );
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    let first = engine.process_utterance("flashlight, shut down, stop recording", false, true);
    let second = engine.process_utterance("flashlight, shut down, stop recording", false, true);

    assert_eq!(first, DispatchOutcome::SomethingExecuted);
    assert_eq!(first, second);
    assert!(drain(&mut rx).is_empty());
    assert!(device.calls().is_empty());
}

#[test]
fn test_detection_error_recovers_listening() {
    let engine = engine(
        ScriptedDetector::replying("ERR_CMD_DETECT - index out of range"),
        Arc::default(),
    );
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    let outcome = engine.process_utterance("turn the thing", false, false);
    assert_eq!(outcome, DispatchOutcome::DetectionError);

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], ActionMessage::StartPassiveListening);
    assert!(matches!(
        &messages[1],
        ActionMessage::Speak { priority: SpeechPriority::High, text, .. }
            if text.contains("index out of range") && text.ends_with("You said: turn the thing")
    ));
}

#[test]
fn test_detector_crash_is_a_detection_error() {
    let engine = engine(ScriptedDetector::failing("exit status 3"), Arc::default());
    assert_eq!(
        engine.process_utterance("hello", false, false),
        DispatchOutcome::DetectionError
    );
}

#[test]
fn test_unavailable_detector_is_not_called() {
    let detector = Arc::new(ScriptedDetector::unavailable());
    let engine = DispatchEngine::new(
        platform(detector.clone(), Arc::default()),
        ActionBus::new(),
        &DispatchConfig::default(),
    );

    assert_eq!(
        engine.process_utterance("what time is it", false, false),
        DispatchOutcome::PrerequisiteUnavailable
    );
    assert_eq!(detector.calls(), 0);
}

#[test]
fn test_nothing_detected_is_silent() {
    let engine = engine(ScriptedDetector::replying("99|abc.def|"), Arc::default());
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    assert_eq!(
        engine.process_utterance("lorem ipsum", false, false),
        DispatchOutcome::NothingExecuted
    );
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_camera_and_stop_recording_actions() {
    let engine = engine(
        ScriptedDetector::replying("1.RET_ON|15.RET_15_REAR|15|20.RET_20_ANY"),
        Arc::default(),
    );
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    engine.process_utterance("lights, photos, stop", false, false);
    let messages = drain(&mut rx);
    assert_eq!(
        &messages[..4],
        &[
            ActionMessage::UseCamera {
                usage: CameraUsage::FlashlightOn
            },
            ActionMessage::UseCamera {
                usage: CameraUsage::TakeRearPhoto
            },
            ActionMessage::UseCamera {
                usage: CameraUsage::TakeFrontalPhoto
            },
            ActionMessage::RecordAudio {
                start: false,
                source: AudioSource::Unspecified,
                restart_recognition: true,
            },
        ]
    );
}

struct Recorder;

impl Module for Recorder {
    fn is_fully_working(&self) -> bool {
        true
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_record_audio_waits_for_final_result() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(ModuleDescriptor::new(
            AUDIO_RECORDER_MODULE,
            ModuleKind::Service,
            |_ctx| Ok(Box::new(Recorder) as Box<dyn Module>),
        ))
        .unwrap();
    let registry = Arc::new(registry);

    let engine = engine(
        ScriptedDetector::replying("16.RET_16_AUDIO"),
        Arc::default(),
    )
    .with_modules(Arc::downgrade(&registry));
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    assert_eq!(
        engine.process_utterance("record audio", true, false),
        DispatchOutcome::NothingExecuted
    );
    assert!(drain(&mut rx).is_empty());

    assert_eq!(
        engine.process_utterance("record audio", false, false),
        DispatchOutcome::SomethingExecuted
    );
    assert_eq!(
        &drain(&mut rx)[..2],
        &[
            ActionMessage::StopRecognition,
            ActionMessage::RecordAudio {
                start: true,
                source: AudioSource::Mic,
                restart_recognition: false,
            },
        ]
    );
}

#[test]
fn test_record_audio_without_recorder() {
    let engine = engine(
        ScriptedDetector::replying("16.RET_16_AUDIO"),
        Arc::default(),
    );
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    engine.process_utterance("record audio", false, false);
    let said = spoken(&drain(&mut rx));
    assert_eq!(said.len(), 1);
    assert!(said[0].starts_with("Audio recording is not supported"));
}

#[test]
fn test_media_and_calls() {
    let device = Arc::new(FakeDevice::default());
    let engine = engine(
        ScriptedDetector::replying("21|23|24|8|9|14.RET_14_RECOVERY|12"),
        device.clone(),
    );
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    engine.process_utterance("a lot of things", false, false);
    assert_eq!(
        spoken(&drain(&mut rx)),
        vec![
            "Already stopped sir.",
            "Next one sir.",
            "Error answering the call.",
            "Call ended.",
            "Rebooting the device...",
            "No permission to shut down the device.",
        ]
    );
    assert_eq!(
        device.calls(),
        vec![
            "media Play",
            "media Next",
            "answer_call",
            "end_call",
            "reboot Recovery",
            "shut_down",
        ]
    );
}

#[cfg(unix)]
#[test]
fn test_hung_detector_recovers_listening() {
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};

    use visor_assistant::config::DetectorConfig;
    use visor_assistant::detector::ProcessDetector;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("acd");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let detector = ProcessDetector::new(&DetectorConfig {
        command: Some(path),
        timeout: Duration::from_secs(1),
        ..DetectorConfig::default()
    });
    let mut platform = platform(Arc::new(ScriptedDetector::replying("")), Arc::default());
    platform.detector = Arc::new(detector);
    let engine = DispatchEngine::new(platform, ActionBus::new(), &DispatchConfig::default());
    let (_, mut rx) = engine.bus().subscribe_channel(ActionFilter::All);

    let started = Instant::now();
    let outcome = engine.process_utterance("what time is it", false, false);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome, DispatchOutcome::DetectionError);

    let messages = drain(&mut rx);
    assert_eq!(messages[0], ActionMessage::StartPassiveListening);
    assert!(matches!(
        &messages[1],
        ActionMessage::Speak { text, .. } if text.contains("timed out")
    ));
}
