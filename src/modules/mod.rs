//! Module descriptor table
//!
//! A module is an independently supportable, independently lifecycled unit of
//! functionality (audio recording, speech recognition, the command executor,
//! ...). Each one is registered once through a [`ModuleDescriptor`] and its
//! liveness is reconciled by the [`Supervisor`].

mod supervisor;

pub use supervisor::{RestartPolicy, Supervisor, TickReport};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::bus::ActionBus;
use crate::config::WatchdogConfig;
use crate::watchdog::Watchdog;
use crate::{Error, Result};

/// A running module instance
pub trait Module: Send {
    /// Liveness probe; false means the supervisor should restart it
    fn is_fully_working(&self) -> bool;

    /// Release everything the instance holds
    ///
    /// # Errors
    ///
    /// Returns error if teardown fails; callers treat that as best effort
    fn destroy(&mut self) -> Result<()>;
}

/// How a module runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Isolated background service
    Service,
    /// In-process worker
    Instance,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Instance => write!(f, "instance"),
        }
    }
}

/// Everything a module factory gets to build an instance
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Shared action bus
    pub bus: ActionBus,
    /// Where modules keep recordings, photos and state
    pub data_dir: PathBuf,
    /// Watchdog shared by every module that guards a multi-step operation
    pub watchdog: Watchdog,
    registry: Weak<ModuleRegistry>,
}

impl ModuleContext {
    #[must_use]
    pub fn new(bus: ActionBus, data_dir: PathBuf) -> Self {
        Self {
            bus,
            data_dir,
            watchdog: Watchdog::from_config(&WatchdogConfig::default()),
            registry: Weak::new(),
        }
    }

    /// Share the given watchdog instead of the default one
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Registry the module lives in, if it is still around
    ///
    /// Set by the supervisor; instances hold it weakly since the registry
    /// owns them.
    #[must_use]
    pub fn registry(&self) -> Option<Arc<ModuleRegistry>> {
        self.registry.upgrade()
    }

    /// Weak handle to the registry
    #[must_use]
    pub fn registry_handle(&self) -> Weak<ModuleRegistry> {
        self.registry.clone()
    }

    pub(crate) fn attach(&mut self, registry: &Arc<ModuleRegistry>) {
        self.registry = Arc::downgrade(registry);
    }
}

type SupportedFn = Box<dyn Fn() -> Result<bool> + Send + Sync>;
type FactoryFn = Box<dyn Fn(&ModuleContext) -> Result<Box<dyn Module>> + Send + Sync>;

/// Static description of a module
pub struct ModuleDescriptor {
    id: String,
    kind: ModuleKind,
    start_on_boot: bool,
    supported: SupportedFn,
    factory: FactoryFn,
}

impl ModuleDescriptor {
    /// Describe a module that is always supported and wanted running
    pub fn new<F>(id: impl Into<String>, kind: ModuleKind, factory: F) -> Self
    where
        F: Fn(&ModuleContext) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            kind,
            start_on_boot: true,
            supported: Box::new(|| Ok(true)),
            factory: Box::new(factory),
        }
    }

    /// Set the supportability predicate
    ///
    /// It is re-evaluated on every supervisor pass, since permissions and
    /// hardware can change while running.
    #[must_use]
    pub fn supported_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> Result<bool> + Send + Sync + 'static,
    {
        self.supported = Box::new(predicate);
        self
    }

    /// Register the module as not wanted running until requested
    #[must_use]
    pub const fn on_demand(mut self) -> Self {
        self.start_on_boot = false;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Evaluate the predicate; an error counts as unsupported
    #[must_use]
    pub fn check_supported(&self) -> bool {
        match (self.supported)() {
            Ok(supported) => supported,
            Err(e) => {
                tracing::warn!(module = %self.id, error = %e, "support check failed");
                false
            }
        }
    }

    fn instantiate(&self, ctx: &ModuleContext) -> Result<Box<dyn Module>> {
        (self.factory)(ctx)
    }
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("start_on_boot", &self.start_on_boot)
            .finish_non_exhaustive()
    }
}

/// Supervision record of one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleStatus {
    /// Outcome of the last support check
    pub supported: bool,
    /// Instance present and its last probe healthy
    pub running: bool,
    /// Whether the supervisor keeps the module alive
    pub desired_running: bool,
    /// When the supervisor last looked at the module
    pub last_checked: Option<DateTime<Utc>>,
    /// Restarts since the module was last seen healthy
    pub consecutive_restarts: u32,
    /// Restart ceiling reached; no more restarts until healthy or reset
    pub parked: bool,
}

/// Registered module with its status, as listed to callers
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub id: String,
    pub kind: ModuleKind,
    #[serde(flatten)]
    pub status: ModuleStatus,
}

/// Mutable per-module state, owned by the supervisor
#[derive(Default)]
struct ModuleSlot {
    instance: Option<Box<dyn Module>>,
    status: ModuleStatus,
    last_restart: Option<Instant>,
}

struct ModuleEntry {
    descriptor: ModuleDescriptor,
    slot: Mutex<ModuleSlot>,
}

impl ModuleEntry {
    fn lock(&self) -> std::sync::MutexGuard<'_, ModuleSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Table of every module known to the process
///
/// Built once at startup, then shared as `Arc<ModuleRegistry>` with the
/// supervisor and whoever needs to read module state. Entries keep
/// registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<ModuleEntry>,
}

impl ModuleRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module
    ///
    /// # Errors
    ///
    /// Returns error if a module with the same id is already registered
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        if self.position(descriptor.id()).is_some() {
            return Err(Error::Module(format!(
                "module already registered: {}",
                descriptor.id()
            )));
        }

        tracing::debug!(module = %descriptor.id(), kind = %descriptor.kind(), "module registered");

        let slot = ModuleSlot {
            status: ModuleStatus {
                desired_running: descriptor.start_on_boot,
                ..ModuleStatus::default()
            },
            ..ModuleSlot::default()
        };
        self.entries.push(ModuleEntry {
            descriptor,
            slot: Mutex::new(slot),
        });
        Ok(())
    }

    /// Module ids in registration order
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.descriptor.id()).collect()
    }

    /// Current supervision record of a module
    #[must_use]
    pub fn status(&self, id: &str) -> Option<ModuleStatus> {
        self.entry(id).map(|e| e.lock().status.clone())
    }

    /// Evaluate a module's support predicate now
    ///
    /// # Errors
    ///
    /// Returns error if no module has this id
    pub fn is_supported(&self, id: &str) -> Result<bool> {
        self.entry(id)
            .map(|e| e.descriptor.check_supported())
            .ok_or_else(|| Error::ModuleNotFound(id.to_string()))
    }

    /// Every module with its status, in registration order
    #[must_use]
    pub fn list(&self) -> Vec<ModuleInfo> {
        self.entries
            .iter()
            .map(|e| ModuleInfo {
                id: e.descriptor.id().to_string(),
                kind: e.descriptor.kind(),
                status: e.lock().status.clone(),
            })
            .collect()
    }

    /// Number of registered modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no module is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.descriptor.id() == id)
    }

    fn entry(&self, id: &str) -> Option<&ModuleEntry> {
        self.position(id).map(|i| &self.entries[i])
    }

    fn entries(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.entries.iter()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.ids())
            .finish()
    }
}

/// Shared handle to the registry
pub type SharedRegistry = Arc<ModuleRegistry>;
