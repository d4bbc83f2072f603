//! Speech-recognition session
//!
//! One listening session of a callback-driven recognizer. The recognizer can
//! stall between callbacks without reporting anything, so every callback moves
//! a watchdog checkpoint and a stalled session is torn down by the watchdog.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::Result;
use crate::bus::{ActionBus, ActionMessage, SpeechPriority};
use crate::modules::Module;
use crate::watchdog::{Checkpoint, TripReport, Watchdog, WatchdogSession};

/// Launches requested longer ago than this are relaunches by the host, not
/// by the user
pub const MAX_LAUNCH_DELAY: Duration = Duration::from_secs(1);

/// Time given to the "Listening..." prompt before the microphone is checked
pub const MIC_SETTLE: Duration = Duration::from_millis(500);

/// Vibration signalling the recognizer is ready
pub const READY_VIBRATION_MS: u64 = 300;

/// Recognizer callback checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionCheckpoint {
    Started,
    ReadyForSpeech,
    BeginningOfSpeech,
    EndOfSpeech,
    /// Results or error delivered
    Finished,
}

impl Checkpoint for RecognitionCheckpoint {
    fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::ReadyForSpeech => "ready_for_speech",
            Self::BeginningOfSpeech => "beginning_of_speech",
            Self::EndOfSpeech => "end_of_speech",
            Self::Finished => "finished",
        }
    }

    fn budget(&self) -> Option<Duration> {
        match self {
            Self::Started | Self::ReadyForSpeech | Self::BeginningOfSpeech => {
                Some(Duration::from_secs(3))
            }
            Self::EndOfSpeech => Some(Duration::from_secs(5)),
            Self::Finished => None,
        }
    }
}

/// The recognizer engine driven by a session
pub trait RecognitionBackend: Send {
    /// Whether the microphone can be opened right now
    fn mic_available(&self) -> bool;

    /// Begin listening; callbacks follow
    ///
    /// # Errors
    ///
    /// Returns error if the engine refused to start
    fn start_listening(&mut self) -> Result<()>;

    fn stop_listening(&mut self);

    fn cancel(&mut self);

    fn destroy(&mut self);
}

/// Ends whatever hosts the session (a worker, a child process)
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, reason: &str);
}

/// How a start request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Listening,
    /// Requested too long ago; torn down without listening
    Stale,
    /// Microphone in use; torn down
    ResourcesBusy,
}

struct Teardown {
    backend: Option<Box<dyn RecognitionBackend>>,
    terminator: Arc<dyn ProcessTerminator>,
    done: bool,
}

impl Teardown {
    fn run(&mut self, reason: &str) -> bool {
        if self.done {
            return false;
        }
        self.done = true;

        if let Some(mut backend) = self.backend.take() {
            backend.stop_listening();
            backend.cancel();
            backend.destroy();
        }
        tracing::info!(reason, "recognition session torn down");
        self.terminator.terminate(reason);
        true
    }
}

type SharedTeardown = Arc<Mutex<Teardown>>;

fn lock(teardown: &SharedTeardown) -> MutexGuard<'_, Teardown> {
    teardown.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single listening session
pub struct RecognitionSession {
    bus: ActionBus,
    watchdog: Watchdog,
    guard: Option<WatchdogSession<RecognitionCheckpoint>>,
    teardown: SharedTeardown,
    listening: bool,
}

impl RecognitionSession {
    #[must_use]
    pub fn new(
        bus: ActionBus,
        watchdog: Watchdog,
        backend: Box<dyn RecognitionBackend>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        Self {
            bus,
            watchdog,
            guard: None,
            teardown: Arc::new(Mutex::new(Teardown {
                backend: Some(backend),
                terminator,
                done: false,
            })),
            listening: false,
        }
    }

    /// Start the session
    ///
    /// `requested_at` is when the user asked for it; stale requests are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the watchdog cannot be armed or the backend refuses to
    /// start; the session is torn down in both cases
    pub async fn start(&mut self, requested_at: Instant) -> Result<StartOutcome> {
        if requested_at + MAX_LAUNCH_DELAY < Instant::now() {
            tracing::warn!(
                delay_ms = requested_at.elapsed().as_millis(),
                "stale recognition launch"
            );
            self.tear_down("stale launch");
            return Ok(StartOutcome::Stale);
        }

        let teardown = Arc::clone(&self.teardown);
        let armed = self.watchdog.arm(move |report: TripReport| {
            let reason = format!(
                "recognizer stalled at {} for {:?}",
                report.checkpoint, report.elapsed
            );
            lock(&teardown).run(&reason);
        });
        let mut guard = match armed {
            Ok(guard) => guard,
            Err(e) => {
                self.tear_down("watchdog unavailable");
                return Err(e);
            }
        };
        guard.reach(RecognitionCheckpoint::Started);
        self.guard = Some(guard);

        self.bus.publish(ActionMessage::speak("Listening...", false));
        tokio::time::sleep(MIC_SETTLE).await;

        let started = {
            let mut teardown = lock(&self.teardown);
            match teardown.backend.as_mut() {
                Some(backend) if backend.mic_available() => Some(backend.start_listening()),
                Some(_) => None,
                // Tripped while waiting
                None => return Ok(StartOutcome::ResourcesBusy),
            }
        };

        match started {
            Some(Ok(())) => Ok(StartOutcome::Listening),
            Some(Err(e)) => {
                self.tear_down("backend failed to start");
                Err(e)
            }
            None => {
                self.bus.publish(ActionMessage::Speak {
                    text: "Resources are busy".to_string(),
                    priority: SpeechPriority::High,
                    speak_only: true,
                });
                self.tear_down("microphone busy");
                Ok(StartOutcome::ResourcesBusy)
            }
        }
    }

    fn reach(&mut self, checkpoint: RecognitionCheckpoint) {
        if let Some(guard) = self.guard.as_mut() {
            guard.reach(checkpoint);
        }
    }

    fn clear_watchdog(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            guard.clear();
        }
    }

    pub fn on_ready_for_speech(&mut self) {
        self.reach(RecognitionCheckpoint::ReadyForSpeech);
        self.bus.publish(ActionMessage::Vibrate {
            duration_ms: READY_VIBRATION_MS,
        });
    }

    pub fn on_beginning_of_speech(&mut self) {
        self.reach(RecognitionCheckpoint::BeginningOfSpeech);
        self.listening = true;
    }

    pub fn on_end_of_speech(&mut self) {
        self.reach(RecognitionCheckpoint::EndOfSpeech);
        self.listening = false;
    }

    /// Recognizer error callback
    ///
    /// Errors arriving while not listening are ignored; engines report errors
    /// after having delivered results. Returns whether the session was torn
    /// down.
    pub fn on_error(&mut self, code: i32) -> bool {
        if !self.listening {
            tracing::debug!(code, "recognizer error ignored");
            return false;
        }
        self.listening = false;
        self.clear_watchdog();
        tracing::warn!(code, "recognizer error");
        self.tear_down("recognizer error")
    }

    /// Final results callback
    ///
    /// Sends the best match to the command executor and ends the session.
    /// Results arriving after a teardown are dropped.
    pub fn on_results(&mut self, matches: &[String]) -> Option<String> {
        if self.is_torn_down() {
            tracing::debug!(alternatives = matches.len(), "results after teardown ignored");
            return None;
        }
        self.reach(RecognitionCheckpoint::Finished);
        self.listening = false;

        let utterance = matches.first().map(|m| m.to_lowercase());
        match &utterance {
            Some(text) => {
                tracing::debug!(utterance = %text, alternatives = matches.len(), "recognized");
                self.bus.publish(ActionMessage::ProcessUtterance {
                    text: text.clone(),
                    partial: false,
                    dry_run: false,
                });
            }
            None => tracing::debug!("recognizer returned no matches"),
        }

        self.tear_down("results delivered");
        utterance
    }

    /// Stop the backend and end the hosting process
    ///
    /// Returns false if the session was already torn down.
    pub fn tear_down(&mut self, reason: &str) -> bool {
        self.clear_watchdog();
        lock(&self.teardown).run(reason)
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        lock(&self.teardown).done
    }

    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }
}

impl Module for RecognitionSession {
    fn is_fully_working(&self) -> bool {
        !self.is_torn_down()
    }

    fn destroy(&mut self) -> Result<()> {
        self.tear_down("destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for RecognitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionSession")
            .field("listening", &self.listening)
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}
