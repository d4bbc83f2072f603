//! Module supervisor
//!
//! Periodically reconciles each module's actual liveness with its desired
//! state. Support is re-evaluated on every pass and never cached.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ModuleContext, ModuleEntry, ModuleRegistry};
use crate::config::SupervisorConfig;
use crate::{Error, Result};

/// When a broken module may be restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartPolicy {
    /// Minimum spacing between two restarts of the same module
    pub backoff: Duration,
    /// Restarts in a row after which the module is parked
    pub max_consecutive: Option<u32>,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            backoff: config.restart_backoff,
            max_consecutive: config.max_consecutive_restarts,
        }
    }
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Modules (re)instantiated during the pass
    pub restarted: Vec<String>,
    /// Modules that hit the restart ceiling during the pass
    pub parked: Vec<String>,
    /// Modules skipped because they are unsupported right now
    pub unsupported: Vec<String>,
}

/// Keeps registered modules alive
pub struct Supervisor {
    registry: Arc<ModuleRegistry>,
    ctx: ModuleContext,
    policy: RestartPolicy,
    check_interval: Duration,
    pass: Mutex<()>,
}

impl Supervisor {
    /// Create a supervisor over a registry
    #[must_use]
    pub fn new(registry: Arc<ModuleRegistry>, mut ctx: ModuleContext, config: &SupervisorConfig) -> Self {
        ctx.attach(&registry);
        Self {
            registry,
            ctx,
            policy: RestartPolicy::from(config),
            check_interval: config.check_interval,
            pass: Mutex::new(()),
        }
    }

    /// Serializes passes with stop requests; slots are only locked briefly
    fn pass(&self) -> MutexGuard<'_, ()> {
        self.pass.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the restart policy
    #[must_use]
    pub const fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Context handed to every module factory
    #[must_use]
    pub const fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    /// Registry this supervisor reconciles
    #[must_use]
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Run one reconciliation pass over every module, in registration order
    pub fn tick(&self) -> TickReport {
        let _pass = self.pass();
        let mut report = TickReport::default();

        for entry in self.registry.entries() {
            self.reconcile(entry, &mut report);
        }

        report
    }

    // Health checks, destroys and factories run with the slot unlocked so a module
    // may read the registry, its own status included.
    fn reconcile(&self, entry: &ModuleEntry, report: &mut TickReport) {
        let id = entry.descriptor.id();
        let supported = entry.descriptor.check_supported();

        let mut instance = {
            let mut slot = entry.lock();
            slot.status.last_checked = Some(chrono::Utc::now());
            slot.status.supported = supported;

            if !supported {
                slot.status.running = false;
                report.unsupported.push(id.to_string());
                return;
            }
            if !slot.status.desired_running {
                return;
            }
            slot.instance.take()
        };

        let healthy = instance.as_ref().is_some_and(|m| m.is_fully_working());

        let mut slot = entry.lock();
        if healthy {
            if slot.status.consecutive_restarts > 0 || slot.status.parked {
                tracing::info!(module = %id, "module healthy again");
            }
            slot.status.running = true;
            slot.status.consecutive_restarts = 0;
            slot.status.parked = false;
            slot.instance = instance;
            return;
        }

        slot.status.running = false;
        if slot.status.parked {
            slot.instance = instance;
            return;
        }

        if let Some(max) = self.policy.max_consecutive {
            if slot.status.consecutive_restarts >= max {
                tracing::error!(
                    module = %id,
                    restarts = slot.status.consecutive_restarts,
                    "restart ceiling reached, module parked"
                );
                slot.status.parked = true;
                slot.instance = instance;
                report.parked.push(id.to_string());
                return;
            }
        }

        let now = Instant::now();
        if let Some(last) = slot.last_restart {
            if now.duration_since(last) < self.policy.backoff {
                tracing::debug!(module = %id, "restart deferred by backoff");
                slot.instance = instance;
                return;
            }
        }

        let attempt = slot.status.consecutive_restarts.saturating_add(1);
        drop(slot);

        if let Some(mut stale) = instance.take() {
            if let Err(e) = stale.destroy() {
                tracing::debug!(module = %id, error = %e, "ignoring failure destroying stale instance");
            }
        }

        tracing::warn!(module = %id, attempt, "module not working, restarting");

        let fresh = match entry.descriptor.instantiate(&self.ctx) {
            Ok(instance) => Some(instance),
            Err(e) => {
                tracing::warn!(module = %id, error = %e, "module failed to start");
                None
            }
        };

        let mut slot = entry.lock();
        slot.instance = fresh;
        slot.status.consecutive_restarts = slot.status.consecutive_restarts.saturating_add(1);
        slot.last_restart = Some(now);
        report.restarted.push(id.to_string());
    }

    /// Ask the supervisor to keep a module running, or to stop it
    ///
    /// Stopping destroys the current instance right away.
    ///
    /// # Errors
    ///
    /// Returns error if no module has this id
    pub fn set_desired_running(&self, id: &str, desired: bool) -> Result<()> {
        let entry = self
            .registry
            .entry(id)
            .ok_or_else(|| Error::ModuleNotFound(id.to_string()))?;

        let _pass = self.pass();
        let instance = {
            let mut slot = entry.lock();
            slot.status.desired_running = desired;
            if desired {
                return Ok(());
            }
            slot.status.running = false;
            slot.instance.take()
        };

        if let Some(mut instance) = instance {
            instance.destroy()?;
        }
        Ok(())
    }

    /// Clear the restart counter and unpark a module
    ///
    /// # Errors
    ///
    /// Returns error if no module has this id
    pub fn reset_restarts(&self, id: &str) -> Result<()> {
        let entry = self
            .registry
            .entry(id)
            .ok_or_else(|| Error::ModuleNotFound(id.to_string()))?;

        let mut slot = entry.lock();
        slot.status.consecutive_restarts = 0;
        slot.status.parked = false;
        slot.last_restart = None;
        Ok(())
    }

    /// Stop every module in registration order
    ///
    /// Failures are logged and do not stop the remaining modules. Returns the
    /// number of modules that failed to stop.
    pub fn shutdown(&self) -> usize {
        let _pass = self.pass();
        let mut failures = 0;

        for entry in self.registry.entries() {
            stop_entry(entry, &mut failures);
        }

        tracing::info!(failures, "all modules stopped");
        failures
    }

    /// Run reconciliation passes until `shutdown` is cancelled
    ///
    /// Cancellation interrupts the wait between passes; the loop exits right
    /// away and every module is then stopped.
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = self.check_interval.as_secs(),
                modules = self.registry.len(),
                "supervisor started"
            );

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.tick();
                        if !report.restarted.is_empty() {
                            tracing::debug!(restarted = ?report.restarted, "supervisor pass done");
                        }
                    }
                }
            }

            tracing::info!("supervisor stopping");
            self.shutdown();
        })
    }
}

fn stop_entry(entry: &ModuleEntry, failures: &mut usize) {
    let id = entry.descriptor.id();
    let instance = {
        let mut slot = entry.lock();
        slot.status.running = false;
        slot.status.desired_running = false;
        slot.instance.take()
    };

    if let Some(mut instance) = instance {
        match instance.destroy() {
            Ok(()) => tracing::debug!(module = %id, "module stopped"),
            Err(e) => {
                *failures += 1;
                tracing::warn!(module = %id, error = %e, "module failed to stop");
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("check_interval", &self.check_interval)
            .finish_non_exhaustive()
    }
}
