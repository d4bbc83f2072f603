//! Checkpoint watchdog
//!
//! Callback-driven engines (speech recognizers especially) can stop calling
//! back without any error. A participant records the last checkpoint it
//! reached; a single shared monitor task polls every armed session and fires
//! the session's trip action once a checkpoint has been held longer than its
//! budget.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::panic_reason;
use crate::config::WatchdogConfig;
use crate::{Error, Result};

/// A named point in an external callback sequence
pub trait Checkpoint: Copy + Send + Sync + std::fmt::Debug + 'static {
    /// Stable name used in logs and trip reports
    fn name(&self) -> &'static str;

    /// Time allowed before the next checkpoint must be reached
    ///
    /// `None` marks a terminal checkpoint: reaching it clears the session.
    fn budget(&self) -> Option<Duration>;
}

/// Identity of an armed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handed to the trip action when a budget is exceeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripReport {
    pub session: SessionId,
    /// Name of the checkpoint that was held too long
    pub checkpoint: &'static str,
    /// How long it was held
    pub elapsed: Duration,
}

type TripAction = Box<dyn FnOnce(TripReport) + Send>;

struct Current {
    checkpoint: &'static str,
    budget: Duration,
    entered: Instant,
}

struct Armed {
    current: Option<Current>,
    on_trip: TripAction,
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Armed>,
    monitor_running: bool,
    monitor_launches: u64,
}

struct Shared {
    state: Mutex<State>,
    poll_interval: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared watchdog service
///
/// Cheap to clone. One monitor task serves every session and only runs while
/// at least one session has a checkpoint pending.
#[derive(Clone)]
pub struct Watchdog {
    shared: Arc<Shared>,
}

impl Watchdog {
    /// Create a watchdog polling at the given interval
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                poll_interval,
            }),
        }
    }

    /// Create a watchdog from configuration
    #[must_use]
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(config.poll_interval)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval
    }

    /// Arm a new session
    ///
    /// `on_trip` runs at most once, on the monitor task, if a checkpoint is
    /// held past its budget. Nothing is monitored until the first checkpoint is
    /// reached.
    ///
    /// # Errors
    ///
    /// Returns error if called outside a Tokio runtime
    pub fn arm<C, F>(&self, on_trip: F) -> Result<WatchdogSession<C>>
    where
        C: Checkpoint,
        F: FnOnce(TripReport) + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Watchdog(format!("no async runtime for monitor: {e}")))?;

        let id = SessionId(Uuid::new_v4());
        self.shared.lock().sessions.insert(
            id,
            Armed {
                current: None,
                on_trip: Box::new(on_trip),
            },
        );
        tracing::debug!(session = %id, "watchdog armed");

        Ok(WatchdogSession {
            watchdog: self.clone(),
            id,
            runtime,
            finished: false,
            _checkpoint: PhantomData,
        })
    }

    /// Number of sessions still armed
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    /// Whether the monitor task is currently running
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.shared.lock().monitor_running
    }

    fn reach(&self, id: SessionId, name: &'static str, budget: Option<Duration>, runtime: &Handle) -> bool {
        let mut state = self.shared.lock();

        let Some(budget) = budget else {
            let removed = state.sessions.remove(&id).is_some();
            if removed {
                tracing::debug!(session = %id, checkpoint = name, "watchdog cleared by terminal checkpoint");
            }
            return removed;
        };

        let Some(armed) = state.sessions.get_mut(&id) else {
            return false;
        };
        armed.current = Some(Current {
            checkpoint: name,
            budget,
            entered: Instant::now(),
        });
        tracing::trace!(session = %id, checkpoint = name, "checkpoint reached");

        // A quirky engine may report the same checkpoint twice in a row; the
        // monitor must still run only once.
        if !state.monitor_running {
            state.monitor_running = true;
            state.monitor_launches += 1;
            let watchdog = self.clone();
            runtime.spawn(async move { watchdog.monitor().await });
        }
        true
    }

    fn clear(&self, id: SessionId) -> bool {
        let removed = self.shared.lock().sessions.remove(&id).is_some();
        if removed {
            tracing::debug!(session = %id, "watchdog cleared");
        }
        removed
    }

    async fn monitor(self) {
        tracing::debug!("watchdog monitor started");

        loop {
            tokio::time::sleep(self.shared.poll_interval).await;

            let (tripped, idle) = {
                let mut state = self.shared.lock();
                let now = Instant::now();

                let expired: Vec<SessionId> = state
                    .sessions
                    .iter()
                    .filter_map(|(id, armed)| {
                        armed
                            .current
                            .as_ref()
                            .filter(|c| now.duration_since(c.entered) >= c.budget)
                            .map(|_| *id)
                    })
                    .collect();

                let tripped: Vec<(TripReport, TripAction)> = expired
                    .into_iter()
                    .filter_map(|id| state.sessions.remove(&id).map(|armed| (id, armed)))
                    .filter_map(|(id, armed)| {
                        let current = armed.current?;
                        Some((
                            TripReport {
                                session: id,
                                checkpoint: current.checkpoint,
                                elapsed: now.duration_since(current.entered),
                            },
                            armed.on_trip,
                        ))
                    })
                    .collect();

                let idle = !state.sessions.values().any(|armed| armed.current.is_some());
                if idle {
                    state.monitor_running = false;
                }
                (tripped, idle)
            };

            for (report, on_trip) in tripped {
                tracing::error!(
                    session = %report.session,
                    checkpoint = report.checkpoint,
                    elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                    "watchdog budget exceeded, tripping"
                );
                let session = report.session;
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || on_trip(report)));
                if let Err(panic) = outcome {
                    tracing::error!(
                        %session,
                        reason = panic_reason(panic.as_ref()),
                        "watchdog trip action panicked"
                    );
                }
            }

            if idle {
                tracing::debug!("watchdog monitor stopped");
                return;
            }
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("poll_interval", &self.shared.poll_interval)
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

/// An armed watchdog session
///
/// Dropping the session clears it.
pub struct WatchdogSession<C: Checkpoint> {
    watchdog: Watchdog,
    id: SessionId,
    runtime: Handle,
    finished: bool,
    _checkpoint: PhantomData<C>,
}

impl<C: Checkpoint> WatchdogSession<C> {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Record that `checkpoint` was just reached
    ///
    /// Entering a checkpoint leaves the previous one. Returns false if the
    /// session is already cleared or tripped.
    pub fn reach(&mut self, checkpoint: C) -> bool {
        if self.finished {
            return false;
        }
        let live = self
            .watchdog
            .reach(self.id, checkpoint.name(), checkpoint.budget(), &self.runtime);
        if !live || checkpoint.budget().is_none() {
            self.finished = true;
        }
        live
    }

    /// Stop monitoring this session
    ///
    /// Returns false if it was already cleared or tripped.
    pub fn clear(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.watchdog.clear(self.id)
    }

    /// Whether the session is cleared or tripped
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<C: Checkpoint> Drop for WatchdogSession<C> {
    fn drop(&mut self) {
        if !self.finished {
            self.watchdog.clear(self.id);
        }
    }
}

impl<C: Checkpoint> std::fmt::Debug for WatchdogSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogSession")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Waiting,
        Slow,
        Done,
    }

    impl Checkpoint for Step {
        fn name(&self) -> &'static str {
            match self {
                Self::Waiting => "waiting",
                Self::Slow => "slow",
                Self::Done => "done",
            }
        }

        fn budget(&self) -> Option<Duration> {
            match self {
                Self::Waiting => Some(Duration::from_secs(3)),
                Self::Slow => Some(Duration::from_secs(5)),
                Self::Done => None,
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(TripReport) + Send + 'static) {
        let trips = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&trips);
        (trips, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn trips_within_one_poll_of_budget() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut session = watchdog
            .arm::<Step, _>(move |report| {
                let _ = tx.send(report);
            })
            .unwrap();
        let started = Instant::now();
        session.reach(Step::Waiting);

        let report = rx.recv().await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(4));
        assert_eq!(report.checkpoint, "waiting");
        assert!(report.elapsed >= Duration::from_secs(3));
        assert_eq!(report.session, session.id());

        // Tripped sessions are gone and the monitor has exited
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(watchdog.active_sessions(), 0);
        assert!(!watchdog.is_monitoring());
        assert!(!session.clear());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_checkpoint_prevents_trip() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let (trips, on_trip) = counter();

        let mut session = watchdog.arm::<Step, _>(on_trip).unwrap();
        session.reach(Step::Waiting);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(session.reach(Step::Done));
        assert!(session.is_finished());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(trips.load(Ordering::SeqCst), 0);
        assert!(!watchdog.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn new_checkpoint_restarts_the_clock() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let (trips, on_trip) = counter();

        let mut session = watchdog.arm::<Step, _>(on_trip).unwrap();
        session.reach(Step::Waiting);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        session.reach(Step::Slow);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(trips.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(trips.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_checkpoint_starts_one_monitor() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let (_trips, on_trip) = counter();

        let mut session = watchdog.arm::<Step, _>(on_trip).unwrap();
        session.reach(Step::Waiting);
        session.reach(Step::Waiting);
        assert_eq!(watchdog.shared.lock().monitor_launches, 1);
        assert!(watchdog.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_share_one_monitor() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let (first_trips, first) = counter();
        let (second_trips, second) = counter();

        let mut a = watchdog.arm::<Step, _>(first).unwrap();
        let mut b = watchdog.arm::<Step, _>(second).unwrap();
        a.reach(Step::Waiting);
        b.reach(Step::Slow);
        assert_eq!(watchdog.shared.lock().monitor_launches, 1);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert_eq!(first_trips.load(Ordering::SeqCst), 1);
        assert_eq!(second_trips.load(Ordering::SeqCst), 0);

        b.clear();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(second_trips.load(Ordering::SeqCst), 0);
        assert!(!watchdog.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_session_clears_it() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let (trips, on_trip) = counter();

        {
            let mut session = watchdog.arm::<Step, _>(on_trip).unwrap();
            session.reach(Step::Waiting);
        }
        assert_eq!(watchdog.active_sessions(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(trips.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_trip_leaves_other_sessions_monitored() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let (second_trips, second) = counter();
        let (third_trips, third) = counter();

        let mut a = watchdog
            .arm::<Step, _>(|_| panic!("trip action failed"))
            .unwrap();
        let mut b = watchdog.arm::<Step, _>(second).unwrap();
        a.reach(Step::Waiting);
        b.reach(Step::Slow);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(second_trips.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_monitoring());

        // A session armed afterwards still gets a monitor
        let mut c = watchdog.arm::<Step, _>(third).unwrap();
        c.reach(Step::Waiting);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(third_trips.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.active_sessions(), 0);
    }

    #[test]
    fn arm_outside_runtime_fails() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let result = watchdog.arm::<Step, _>(|_| {});
        assert!(matches!(result, Err(Error::Watchdog(_))));
    }
}
