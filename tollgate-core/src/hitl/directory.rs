//! Process-wide lookup from correlation id to the waiting coordinator.

use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Something that owns result slots and can fill them.
pub trait RequestResolver: Send + Sync {
    /// Fill the slot for `request_id`. Returns `false` if the id is unknown
    /// or the slot already holds a result.
    fn resolve(&self, request_id: &str, payload: Value) -> bool;
}

/// Non-owning index of outstanding requests.
///
/// Construct one per process and hand it to every coordinator and every
/// inbound delivery path (reply handlers, bus listeners). Entries hold weak
/// references, so a dropped coordinator never stays alive through the
/// directory.
#[derive(Default)]
pub struct RequestDirectory {
    entries: Mutex<HashMap<String, Weak<dyn RequestResolver>>>,
}

impl RequestDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty, shareable directory.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Route `request_id` to `resolver`.
    pub fn register(&self, request_id: impl Into<String>, resolver: Weak<dyn RequestResolver>) {
        self.entries.lock().insert(request_id.into(), resolver);
    }

    /// Drop the route for `request_id`.
    pub fn unregister(&self, request_id: &str) -> bool {
        self.entries.lock().remove(request_id).is_some()
    }

    /// Deliver a payload to whichever coordinator is waiting on `request_id`.
    pub fn resolve_by_request_id(&self, request_id: &str, payload: Value) -> bool {
        let resolver = self
            .entries
            .lock()
            .get(request_id)
            .and_then(Weak::upgrade);

        match resolver {
            Some(resolver) => resolver.resolve(request_id, payload),
            None => {
                debug!("No waiter registered for request {}", request_id);
                false
            }
        }
    }

    /// True when a waiter is registered for `request_id`.
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().contains_key(request_id)
    }

    /// Number of registered requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Slots(Mutex<HashMap<String, Value>>);

    impl RequestResolver for Slots {
        fn resolve(&self, request_id: &str, payload: Value) -> bool {
            let mut slots = self.0.lock();
            if slots.contains_key(request_id) {
                return false;
            }
            slots.insert(request_id.to_string(), payload);
            true
        }
    }

    #[test]
    fn test_routes_to_registered_resolver() {
        let directory = RequestDirectory::new();
        let slots = Arc::new(Slots::default());
        let weak: Weak<dyn RequestResolver> = Arc::downgrade(&slots) as Weak<Slots>;
        directory.register("hitl_1", weak);

        assert!(directory.contains("hitl_1"));
        assert!(directory.resolve_by_request_id("hitl_1", json!(1)));
        assert!(!directory.resolve_by_request_id("hitl_1", json!(2)));
        assert!(!directory.resolve_by_request_id("hitl_2", json!(3)));
        assert_eq!(slots.0.lock()["hitl_1"], json!(1));

        assert!(directory.unregister("hitl_1"));
        assert!(!directory.unregister("hitl_1"));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_dropped_resolver_is_not_kept_alive() {
        let directory = RequestDirectory::new();
        let slots = Arc::new(Slots::default());
        let weak: Weak<dyn RequestResolver> = Arc::downgrade(&slots) as Weak<Slots>;
        directory.register("hitl_1", weak);
        drop(slots);

        assert!(!directory.resolve_by_request_id("hitl_1", json!(1)));
        assert_eq!(directory.len(), 1);
    }
}
