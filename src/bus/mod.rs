//! Action bus
//!
//! In-process, many-to-many publish/subscribe channel that decouples command
//! handlers from the modules acting on their requests.
//!
//! Every subscriber owns an unbounded FIFO queue, so two messages published by
//! the same thread reach each subscriber in publish order. Handler subscribers
//! drain their queue on a dedicated task; a panicking handler is logged and
//! keeps receiving.

mod types;

pub use types::{
    ActionFilter, ActionMessage, AudioSource, CameraUsage, Param, ParamValue, SpeechPriority,
};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{Error, Result};

/// Handle returned by a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscriber {
    filter: ActionFilter,
    tx: mpsc::UnboundedSender<ActionMessage>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
}

/// Asynchronous publish/subscribe channel for actions
///
/// Cloning is cheap; all clones share the same subscriber set.
#[derive(Clone, Default)]
pub struct ActionBus {
    inner: Arc<BusInner>,
}

impl ActionBus {
    /// Create a bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to every action matching `filter`
    ///
    /// The handler runs on its own task, never on the publisher's.
    ///
    /// # Errors
    ///
    /// Returns error if called outside a Tokio runtime
    pub fn subscribe<F>(&self, filter: ActionFilter, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&ActionMessage) + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Bus(format!("no async runtime for subscriber: {e}")))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ActionMessage>();
        let id = self.insert(filter, tx);

        runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&message)));
                if let Err(panic) = outcome {
                    tracing::error!(
                        subscription = %id,
                        action = %message,
                        reason = panic_reason(panic.as_ref()),
                        "action handler panicked"
                    );
                }
            }
            tracing::trace!(subscription = %id, "subscriber drained");
        });

        Ok(id)
    }

    /// Subscribe with a channel instead of a handler
    ///
    /// The caller drains the receiver at its own pace.
    #[must_use]
    pub fn subscribe_channel(
        &self,
        filter: ActionFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ActionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.insert(filter, tx), rx)
    }

    fn insert(&self, filter: ActionFilter, tx: mpsc::UnboundedSender<ActionMessage>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        tracing::debug!(subscription = %id, ?filter, "subscriber registered");
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscriber { filter, tx });
        id
    }

    /// Remove a subscription
    ///
    /// Returns false if it was already gone; that is not an error.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();

        if removed {
            tracing::debug!(subscription = %id, "subscriber removed");
        }
        removed
    }

    /// Whether a subscription is still registered
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Publish an action to every matching subscriber
    ///
    /// Never blocks. Returns the number of subscribers it was queued for.
    pub fn publish(&self, message: ActionMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);

            for (id, subscriber) in subscribers.iter() {
                if !subscriber.filter.matches(message.id()) {
                    continue;
                }
                if subscriber.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        // Receivers that went away without unsubscribing
        for id in closed {
            self.unsubscribe(id);
        }

        tracing::debug!(action = %message, delivered, "action published");
        delivered
    }

    /// Number of registered subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for ActionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

pub(crate) fn panic_reason(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn speak(text: &str) -> ActionMessage {
        ActionMessage::speak(text, false)
    }

    #[test]
    fn channel_subscriber_receives_matching_only() {
        let bus = ActionBus::new();
        let (_id, mut rx) = bus.subscribe_channel(ActionFilter::namespace("speech"));

        assert_eq!(bus.publish(speak("one")), 1);
        assert_eq!(bus.publish(ActionMessage::Vibrate { duration_ms: 10 }), 0);
        assert_eq!(bus.publish(ActionMessage::SayAgain), 1);

        assert_eq!(rx.try_recv().unwrap(), speak("one"));
        assert_eq!(rx.try_recv().unwrap(), ActionMessage::SayAgain);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = ActionBus::new();
        let (id, _rx) = bus.subscribe_channel(ActionFilter::All);

        assert!(bus.is_subscribed(id));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(!bus.is_subscribed(id));
        assert_eq!(bus.publish(speak("nobody")), 0);
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let bus = ActionBus::new();
        let (id, rx) = bus.subscribe_channel(ActionFilter::All);
        drop(rx);

        assert_eq!(bus.publish(speak("gone")), 0);
        assert!(!bus.is_subscribed(id));
    }

    #[test]
    fn subscribe_outside_runtime_fails() {
        let bus = ActionBus::new();
        let result = bus.subscribe(ActionFilter::All, |_| {});
        assert!(matches!(result, Err(Error::Bus(_))));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn handler_preserves_publish_order() {
        let bus = ActionBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let sink = Arc::clone(&seen);
        bus.subscribe(ActionFilter::id(ActionMessage::SPEAK), move |msg| {
            if let ActionMessage::Speak { text, .. } = msg {
                sink.lock().unwrap().push(text.clone());
                if text == "9" {
                    let _ = done_tx.send(());
                }
            }
        })
        .unwrap();

        for i in 0..10 {
            bus.publish(speak(&i.to_string()));
        }

        tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap();
        let seen = seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn panicking_handler_keeps_bus_alive() {
        let bus = ActionBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(ActionFilter::All, move |msg| {
            if let ActionMessage::Speak { text, .. } = msg {
                assert!(text != "boom", "handler exploded");
                let _ = tx.send(text.clone());
            }
        })
        .unwrap();
        let (_other, mut other_rx) = bus.subscribe_channel(ActionFilter::All);

        bus.publish(speak("boom"));
        bus.publish(speak("after"));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("after"));
        assert_eq!(other_rx.try_recv().unwrap(), speak("boom"));
        assert_eq!(other_rx.try_recv().unwrap(), speak("after"));
    }

    #[tokio::test]
    async fn unknown_actions_reach_catch_all_subscribers() {
        let bus = ActionBus::new();
        let (_id, mut rx) = bus.subscribe_channel(ActionFilter::All);

        bus.publish(ActionMessage::Custom {
            id: "telephony.dial".to_string(),
            params: vec![Param::new("number", ParamValue::Str("112".to_string()))],
        });

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.id(), "telephony.dial");
        assert_eq!(msg.params().len(), 1);
    }
}
