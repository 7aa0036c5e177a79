//! Test utilities for tollgate-core.
//!
//! Enable with the `test-utils` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tollgate-core = { version = "...", features = ["test-utils"] }
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tollgate_core::permission::{AskRequest, PermissionManager};
//! use tollgate_core::rules::{Action, Ruleset};
//! use tollgate_core::test_utils::RecordingEmitter;
//!
//! # tokio_test::block_on(async {
//! let recorder = Arc::new(RecordingEmitter::new());
//! let manager = Arc::new(
//!     PermissionManager::builder()
//!         .with_base_rules(Ruleset::from_entries([("bash", "*", Action::Ask)]).unwrap())
//!         .with_emitter(recorder.clone())
//!         .build(),
//! );
//!
//! let asking = manager.clone();
//! let handle = tokio::spawn(async move { asking.ask(AskRequest::new("s1", "bash", ["ls"])).await });
//!
//! let asked = recorder.wait_for("permission_asked", 1, Duration::from_secs(1)).await;
//! assert_eq!(asked[0].payload["patterns"][0], "ls");
//! # handle.abort();
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Notify;

use crate::events::{EmitError, EventEmitter, PublishedEvent};
use crate::hitl::HitlRequest;
use crate::store::{RequestStore, StoreError};

/// An emitter that records every published event.
///
/// Can be told to fail its first N publishes to exercise announce failures.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<PublishedEvent>>,
    failures_left: Mutex<usize>,
    published: Notify,
}

impl RecordingEmitter {
    /// Create a recorder that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder whose first `count` publishes fail.
    pub fn failing_first(count: usize) -> Self {
        Self {
            failures_left: Mutex::new(count),
            ..Self::default()
        }
    }

    /// Every recorded event, in publish order.
    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().clone()
    }

    /// Recorded events with a given `type`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<PublishedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Wait until at least `count` events of a type were recorded.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within `timeout`.
    pub async fn wait_for(
        &self,
        event_type: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<PublishedEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events = self.events_of_type(event_type);
            if events.len() >= count {
                return events;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!(
                    "timed out waiting for {} {} event(s), saw {}",
                    count,
                    event_type,
                    events.len()
                );
            }
        }
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn publish(
        &self,
        event_type: &str,
        conversation_id: &str,
        payload: Value,
    ) -> Result<(), EmitError> {
        {
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(EmitError::Publish("recording emitter told to fail".into()));
            }
        }
        self.events.lock().push(PublishedEvent {
            event_type: event_type.to_string(),
            conversation_id: conversation_id.to_string(),
            payload,
        });
        self.published.notify_waiters();
        Ok(())
    }
}

/// Wait for the first event of a type and return it.
pub async fn wait_for_event(
    recorder: &RecordingEmitter,
    event_type: &str,
    timeout: Duration,
) -> PublishedEvent {
    let mut events = recorder.wait_for(event_type, 1, timeout).await;
    events.swap_remove(0)
}

/// A request store whose every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

#[async_trait]
impl RequestStore for FailingStore {
    async fn create(&self, _request: &HitlRequest) -> Result<(), StoreError> {
        Err(StoreError::Storage("store unavailable".into()))
    }

    async fn get(&self, _id: &str) -> Result<Option<HitlRequest>, StoreError> {
        Err(StoreError::Storage("store unavailable".into()))
    }

    async fn mark_answered(&self, _id: &str, _response: &Value) -> Result<bool, StoreError> {
        Err(StoreError::Storage("store unavailable".into()))
    }

    async fn mark_timed_out(&self, _id: &str) -> Result<bool, StoreError> {
        Err(StoreError::Storage("store unavailable".into()))
    }

    async fn mark_cancelled(&self, _id: &str, _reason: Option<&str>) -> Result<bool, StoreError> {
        Err(StoreError::Storage("store unavailable".into()))
    }

    async fn list_pending(&self, _conversation_id: &str) -> Result<Vec<HitlRequest>, StoreError> {
        Err(StoreError::Storage("store unavailable".into()))
    }
}
