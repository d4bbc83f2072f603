//! Visor assistant - module supervision and command dispatch
//!
//! The core of a voice assistant made of loosely coupled modules (recorder,
//! recognizers, checkers, the command executor) that talk over an in-process
//! action bus:
//! - Action bus with typed messages and isolated subscribers
//! - Module registry and a supervisor that keeps modules alive
//! - Checkpoint watchdog for callback-driven engines that can stall
//! - Command dispatch from recognized utterances to device actions
//!
//! # Architecture
//!
//! ```text
//! utterance ──► DispatchEngine ──► CommandDetector
//!                    │
//!                    ▼ per-code handlers
//!               ActionBus ──► modules ──► platform collaborators
//!
//! Supervisor ──► ModuleRegistry (reconciles desired vs. actual liveness)
//! Watchdog   ──► RecognitionSession (tears down stalled sessions)
//! ```

pub mod bus;
pub mod config;
pub mod connectivity;
pub mod daemon;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod modules;
pub mod platform;
pub mod recognition;
pub mod watchdog;

pub use bus::{ActionBus, ActionFilter, ActionMessage, SubscriptionId};
pub use config::Config;
pub use daemon::Daemon;
pub use dispatch::{CommandExecutor, DispatchEngine, DispatchOutcome};
pub use error::{Error, Result};
pub use modules::{
    Module, ModuleContext, ModuleDescriptor, ModuleKind, ModuleRegistry, ModuleStatus, Supervisor,
};
pub use platform::{ActionResult, Platform};
pub use recognition::{RecognitionCheckpoint, RecognitionSession};
pub use watchdog::{Checkpoint, Watchdog, WatchdogSession};
