// THEORY:
// The `EventBus` decouples the detection layers from whoever wants to hear about
// them. A stage publishes a short human-readable message; every attached
// listener receives it synchronously, in attachment order. The stage never
// learns who is listening.
//
// Delivery is best-effort and isolated: a listener that returns an error, or
// panics, is logged and skipped, and the remaining listeners still receive the
// message. The bus is cheap to clone; clones share one listener list, so a
// session can hand the same bus to every stage it builds.

use crate::error::ListenerError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Receives plain-text notifications.
pub trait Listener: Send + Sync {
    fn update(&self, message: &str) -> Result<(), ListenerError>;
}

/// Handle returned by `attach`, used to detach the same listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn Listener>)>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, listener));
        id
    }

    /// Returns false if no listener with this id was attached.
    pub fn detach(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    /// Delivers `message` to every listener and returns how many accepted it.
    pub fn notify(&self, message: &str) -> usize {
        // Snapshot so listeners may attach or detach while being notified.
        let listeners: Vec<Arc<dyn Listener>> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        let mut delivered = 0;
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.update(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(error = %e, "notification listener failed"),
                Err(_) => warn!("notification listener panicked"),
            }
        }
        delivered
    }
}

/// Writes every notification to the log.
pub struct LogListener;

impl Listener for LogListener {
    fn update(&self, message: &str) -> Result<(), ListenerError> {
        info!(target: "print_watch::notifications", "{message}");
        Ok(())
    }
}

/// Re-publishes notifications on a broadcast channel for UI subscribers.
/// Having no subscribers is not a failure.
pub struct BroadcastListener {
    tx: broadcast::Sender<String>,
}

impl BroadcastListener {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl Listener for BroadcastListener {
    fn update(&self, message: &str) -> Result<(), ListenerError> {
        let _ = self.tx.send(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::test_support::Recorder;

    struct Failing;

    impl Listener for Failing {
        fn update(&self, _message: &str) -> Result<(), ListenerError> {
            Err(ListenerError("disk full".into()))
        }
    }

    struct Panicking;

    impl Listener for Panicking {
        fn update(&self, _message: &str) -> Result<(), ListenerError> {
            panic!("listener bug");
        }
    }

    #[test]
    fn delivers_in_attachment_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl Listener for Tagged {
            fn update(&self, _message: &str) -> Result<(), ListenerError> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
        }

        bus.attach(Arc::new(Tagged("first", order.clone())));
        bus.attach(Arc::new(Tagged("second", order.clone())));
        bus.notify("hello");

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn failing_listeners_do_not_block_others() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.attach(Arc::new(Failing));
        bus.attach(Arc::new(Panicking));
        bus.attach(recorder.clone());

        let delivered = bus.notify("motion started");

        assert_eq!(delivered, 1);
        assert_eq!(recorder.messages(), vec!["motion started".to_string()]);
    }

    #[test]
    fn detached_listener_stops_receiving() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let id = bus.attach(recorder.clone());

        bus.notify("one");
        assert!(bus.detach(id));
        assert!(!bus.detach(id));
        bus.notify("two");

        assert_eq!(recorder.messages(), vec!["one".to_string()]);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn clones_share_listeners() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.clone().attach(recorder.clone());

        assert_eq!(bus.notify("shared"), 1);
    }

    #[test]
    fn broadcast_listener_forwards_messages() {
        let (tx, mut rx) = broadcast::channel(4);
        let bus = EventBus::new();
        bus.attach(Arc::new(BroadcastListener::new(tx)));
        bus.notify("processing resumed");

        assert_eq!(rx.try_recv().unwrap(), "processing resumed");
    }
}
