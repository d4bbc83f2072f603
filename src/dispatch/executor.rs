//! Command executor module
//!
//! Feeds `executor.process_utterance` actions from the bus into the dispatch
//! engine, one at a time and in arrival order.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::DispatchEngine;
use crate::bus::{ActionBus, ActionFilter, ActionMessage, SubscriptionId};
use crate::config::DispatchConfig;
use crate::modules::{Module, ModuleDescriptor, ModuleKind};
use crate::platform::Platform;
use crate::{Error, Result};

/// Bus-facing wrapper around a [`DispatchEngine`]
#[derive(Debug)]
pub struct CommandExecutor {
    bus: ActionBus,
    subscription: Option<SubscriptionId>,
    worker: JoinHandle<()>,
}

impl CommandExecutor {
    /// Registry id
    pub const ID: &'static str = "command_executor";

    /// Subscribe to utterances and start processing them
    ///
    /// # Errors
    ///
    /// Returns error if called outside a Tokio runtime
    pub fn start(engine: Arc<DispatchEngine>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Module(format!("command executor needs a runtime: {e}")))?;

        let bus = engine.bus().clone();
        let (subscription, mut rx) =
            bus.subscribe_channel(ActionFilter::id(ActionMessage::PROCESS_UTTERANCE));

        let worker = runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                let ActionMessage::ProcessUtterance {
                    text,
                    partial,
                    dry_run,
                } = message
                else {
                    continue;
                };

                // Detection runs an external process; keep it off the async workers
                let engine = Arc::clone(&engine);
                let job = tokio::task::spawn_blocking(move || {
                    engine.process_utterance(&text, partial, dry_run)
                });
                match job.await {
                    Ok(outcome) => tracing::info!(%outcome, partial, dry_run, "utterance processed"),
                    Err(e) => tracing::error!(error = %e, "utterance processing failed"),
                }
            }
        });

        tracing::info!(subscription = %subscription, "command executor started");
        Ok(Self {
            bus,
            subscription: Some(subscription),
            worker,
        })
    }

    /// Descriptor building a fresh engine on every (re)start
    ///
    /// The engine publishes on the context bus and queries module support
    /// through the context registry.
    #[must_use]
    pub fn descriptor(platform: Platform, config: DispatchConfig) -> ModuleDescriptor {
        ModuleDescriptor::new(Self::ID, ModuleKind::Instance, move |ctx| {
            let engine = DispatchEngine::new(platform.clone(), ctx.bus.clone(), &config)
                .with_modules(ctx.registry_handle());
            Ok(Box::new(Self::start(Arc::new(engine))?) as Box<dyn Module>)
        })
    }
}

impl Module for CommandExecutor {
    fn is_fully_working(&self) -> bool {
        self.subscription
            .is_some_and(|id| self.bus.is_subscribed(id))
            && !self.worker.is_finished()
    }

    fn destroy(&mut self) -> Result<()> {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
            tracing::info!(subscription = %id, "command executor stopped");
        }
        self.worker.abort();
        Ok(())
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        self.worker.abort();
    }
}
