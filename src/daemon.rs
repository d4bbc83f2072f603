//! Daemon - the assistant process
//!
//! Wires the bus, the module registry and the supervisor together, feeds typed
//! utterances from stdin to the command executor and prints what the
//! assistant says.
//!
//! The host has no audio capture, so no `audio_recorder` module is registered
//! and "record audio" requests are answered as unsupported. Camera and
//! recording actions that do get published are only logged by
//! [`ConsoleOutput`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::bus::{ActionBus, ActionFilter, ActionMessage, SubscriptionId};
use crate::connectivity::{SystemChecker, WifiChecker, WifiRadio};
use crate::detector::ProcessDetector;
use crate::dispatch::{CommandExecutor, DispatchEngine};
use crate::modules::{Module, ModuleContext, ModuleDescriptor, ModuleKind, ModuleRegistry, Supervisor};
use crate::platform::Platform;
use crate::platform::host::HostPlatform;
use crate::watchdog::Watchdog;
use crate::{Config, Error, Result};

/// Pace of the system checker loop
const SYSTEM_CHECK_TICK: Duration = Duration::from_secs(5);

/// Time left to queued utterances once stdin is closed
const EOF_GRACE: Duration = Duration::from_secs(2);

/// Prints speech and logs device actions nobody else handles
#[derive(Debug)]
pub struct ConsoleOutput {
    bus: ActionBus,
    subscription: Option<SubscriptionId>,
}

impl ConsoleOutput {
    pub const ID: &'static str = "console_output";

    /// # Errors
    ///
    /// Returns error if called outside a Tokio runtime
    pub fn start(bus: &ActionBus) -> Result<Self> {
        let filter = ActionFilter::ids(&[
            ActionMessage::SPEAK,
            ActionMessage::SAY_AGAIN,
            ActionMessage::VIBRATE,
            ActionMessage::USE_CAMERA,
            ActionMessage::RECORD_AUDIO,
        ]);
        let subscription = bus.subscribe(filter, |message| match message {
            ActionMessage::Speak { text, priority, .. } => {
                tracing::debug!(?priority, "speaking");
                println!("visor: {text}");
            }
            other => tracing::info!(action = %other, "device action"),
        })?;

        Ok(Self {
            bus: bus.clone(),
            subscription: Some(subscription),
        })
    }

    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(Self::ID, ModuleKind::Instance, |ctx| {
            Ok(Box::new(Self::start(&ctx.bus)?) as Box<dyn Module>)
        })
    }
}

impl Module for ConsoleOutput {
    fn is_fully_working(&self) -> bool {
        self.subscription.is_some_and(|id| self.bus.is_subscribed(id))
    }

    fn destroy(&mut self) -> Result<()> {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        Ok(())
    }
}

/// The assistant daemon
pub struct Daemon {
    config: Config,
    bus: ActionBus,
    platform: Platform,
    registry: Arc<ModuleRegistry>,
    watchdog: Watchdog,
}

impl Daemon {
    /// Create a daemon on the host platform
    ///
    /// # Errors
    ///
    /// Returns error if the module registry cannot be built
    pub fn new(config: Config) -> Result<Self> {
        let host = HostPlatform::new(&config.host);
        let radio: Arc<dyn WifiRadio> = Arc::new(host.clone());
        let detector = Arc::new(ProcessDetector::new(&config.detector));
        let platform = host.into_platform(detector);
        Self::with_platform(config, platform, radio)
    }

    /// Create a daemon on arbitrary collaborators
    ///
    /// # Errors
    ///
    /// Returns error if the module registry cannot be built
    pub fn with_platform(config: Config, platform: Platform, radio: Arc<dyn WifiRadio>) -> Result<Self> {
        let mut registry = ModuleRegistry::new();
        registry.register(ConsoleOutput::descriptor())?;
        registry.register(CommandExecutor::descriptor(
            platform.clone(),
            config.dispatch.clone(),
        ))?;

        let power = Arc::clone(&platform.power);
        let support = Arc::clone(&radio);
        registry.register(
            ModuleDescriptor::new("system_checker", ModuleKind::Service, move |_ctx| {
                let checker = WifiChecker::new(Arc::clone(&radio));
                Ok(Box::new(SystemChecker::start(checker, Arc::clone(&power), SYSTEM_CHECK_TICK)?)
                    as Box<dyn Module>)
            })
            .supported_when(move || Ok(support.is_supported())),
        )?;

        tracing::debug!(modules = registry.len(), "module registry built");

        let watchdog = Watchdog::from_config(&config.watchdog);
        Ok(Self {
            config,
            bus: ActionBus::new(),
            platform,
            registry: Arc::new(registry),
            watchdog,
        })
    }

    #[must_use]
    pub const fn bus(&self) -> &ActionBus {
        &self.bus
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Watchdog handed to every module the supervisor builds
    #[must_use]
    pub const fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// A dispatch engine wired to this daemon's bus and modules
    #[must_use]
    pub fn engine(&self) -> DispatchEngine {
        DispatchEngine::new(self.platform.clone(), self.bus.clone(), &self.config.dispatch)
            .with_modules(Arc::downgrade(&self.registry))
    }

    fn supervisor(&self) -> Arc<Supervisor> {
        let ctx = ModuleContext::new(self.bus.clone(), self.config.data_dir.clone())
            .with_watchdog(self.watchdog.clone());
        Arc::new(Supervisor::new(
            Arc::clone(&self.registry),
            ctx,
            &self.config.supervisor,
        ))
    }

    /// Run until Ctrl-C or end of input
    ///
    /// # Errors
    ///
    /// Returns error if the data directory cannot be created or stdin fails
    pub async fn run(self) -> Result<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            modules = self.registry.len(),
            check_interval = ?self.config.supervisor.check_interval,
            watchdog_poll = ?self.watchdog.poll_interval(),
            "daemon running"
        );

        let shutdown = CancellationToken::new();

        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                ctrl_c.cancel();
            }
        });

        let supervisor = self.supervisor();
        // First pass right away so the executor is up before input arrives
        let report = supervisor.tick();
        tracing::debug!(?report, "initial supervisor pass");
        let supervision = Arc::clone(&supervisor).spawn(shutdown.clone());

        let result = self.read_input(&shutdown).await;

        shutdown.cancel();
        if let Err(e) = supervision.await {
            tracing::error!(error = %e, "supervisor task failed");
        }

        tracing::info!("daemon stopped");
        result
    }

    async fn read_input(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                line = lines.next_line() => {
                    let line = line.map_err(Error::Io)?;
                    let Some(line) = line else {
                        tracing::info!("end of input");
                        tokio::select! {
                            () = shutdown.cancelled() => {}
                            () = tokio::time::sleep(EOF_GRACE) => {}
                        }
                        return Ok(());
                    };

                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    self.bus.publish(ActionMessage::ProcessUtterance {
                        text: text.to_lowercase(),
                        partial: false,
                        dry_run: false,
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
