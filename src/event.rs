//! Listener registrations owned by modules.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::panic_message;

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event name, e.g. `"message.group"`.
    pub name: String,
    /// Arbitrary payload.
    pub payload: serde_json::Value,
}

impl Event {
    /// Create an event with an empty payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Receives events on behalf of a module.
pub trait Listener: Send + Sync {
    /// Whether this listener wants the event.
    fn handles(&self, _event: &Event) -> bool {
        true
    }

    /// Handle an event.
    fn on_event(&self, event: &Event);
}

/// Listener registrations grouped by owning module.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Vec<Arc<dyn Listener>>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `owner`.
    pub fn register(&self, owner: &str, listener: Arc<dyn Listener>) {
        self.listeners
            .entry(owner.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove every listener of `owner`, returning how many were removed.
    pub fn unregister_all(&self, owner: &str) -> usize {
        self.listeners
            .remove(owner)
            .map(|(_, listeners)| listeners.len())
            .unwrap_or(0)
    }

    /// Number of listeners registered by `owner`.
    pub fn count(&self, owner: &str) -> usize {
        self.listeners.get(owner).map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver an event to every interested listener.
    ///
    /// Returns the number of listeners invoked. A panicking listener is
    /// logged and does not stop delivery to the others.
    pub fn dispatch(&self, event: &Event) -> usize {
        let snapshot: Vec<(String, Arc<dyn Listener>)> = self
            .listeners
            .iter()
            .flat_map(|entry| {
                let owner = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(move |l| (owner.clone(), l.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut invoked = 0;
        for (owner, listener) in snapshot {
            if !listener.handles(event) {
                continue;
            }
            invoked += 1;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                tracing::error!(
                    "Listener of {} panicked on {}: {}",
                    owner,
                    event.name,
                    panic_message(payload)
                );
            }
        }
        invoked
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("owners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        hits: Arc<AtomicUsize>,
        only: Option<&'static str>,
    }

    impl Listener for Counting {
        fn handles(&self, event: &Event) -> bool {
            self.only.map_or(true, |n| n == event.name)
        }

        fn on_event(&self, _event: &Event) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl Listener for Panicking {
        fn on_event(&self, _event: &Event) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_dispatch_and_unregister() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.register(
            "Core",
            Arc::new(Counting {
                hits: hits.clone(),
                only: None,
            }),
        );
        registry.register(
            "Core",
            Arc::new(Counting {
                hits: hits.clone(),
                only: Some("tick"),
            }),
        );

        assert_eq!(registry.dispatch(&Event::new("message")), 1);
        assert_eq!(registry.dispatch(&Event::new("tick")), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert_eq!(registry.unregister_all("Core"), 2);
        assert_eq!(registry.dispatch(&Event::new("tick")), 0);
        assert_eq!(registry.unregister_all("Core"), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.register("Bad", Arc::new(Panicking));
        registry.register(
            "Good",
            Arc::new(Counting {
                hits: hits.clone(),
                only: None,
            }),
        );

        assert_eq!(registry.dispatch(&Event::new("any")), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
