//! Durable request storage port and the in-memory implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use crate::hitl::{HitlRequest, RequestStatus};

/// Errors that can occur in request store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A request with this id already exists.
    #[error("Request already exists: {0}")]
    Duplicate(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trait for durable HITL request storage.
///
/// The store is the source of truth for whether an unanswered request
/// exists. Status transitions only happen out of
/// [`RequestStatus::Pending`]; the `mark_*` methods return `false` when
/// the request is unknown or already settled.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new request.
    async fn create(&self, request: &HitlRequest) -> Result<(), StoreError>;

    /// Load a request by id.
    async fn get(&self, id: &str) -> Result<Option<HitlRequest>, StoreError>;

    /// Record a response.
    async fn mark_answered(&self, id: &str, response: &Value) -> Result<bool, StoreError>;

    /// Record that nobody answered in time.
    async fn mark_timed_out(&self, id: &str) -> Result<bool, StoreError>;

    /// Record a cancellation.
    async fn mark_cancelled(&self, id: &str, reason: Option<&str>) -> Result<bool, StoreError>;

    /// Pending requests of a conversation, oldest first.
    async fn list_pending(&self, conversation_id: &str) -> Result<Vec<HitlRequest>, StoreError>;
}

/// Response stored for a cancelled request.
pub fn cancellation_payload(reason: Option<&str>) -> Value {
    let mut payload = serde_json::json!({ "cancelled": true });
    if let Some(reason) = reason {
        payload["reason"] = Value::String(reason.to_string());
    }
    payload
}

/// In-memory request store.
///
/// Requests are lost when the process exits.
#[derive(Default)]
pub struct MemoryRequestStore {
    requests: RwLock<HashMap<String, HitlRequest>>,
}

impl MemoryRequestStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests, settled ones included.
    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }

    fn transition(&self, id: &str, status: RequestStatus, response: Option<Value>) -> bool {
        let mut requests = self.requests.write();
        match requests.get_mut(id) {
            Some(request) if request.status == RequestStatus::Pending => {
                request.status = status;
                request.response = response;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, request: &HitlRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write();
        if requests.contains_key(&request.id) {
            return Err(StoreError::Duplicate(request.id.clone()));
        }
        requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<HitlRequest>, StoreError> {
        Ok(self.requests.read().get(id).cloned())
    }

    async fn mark_answered(&self, id: &str, response: &Value) -> Result<bool, StoreError> {
        Ok(self.transition(id, RequestStatus::Answered, Some(response.clone())))
    }

    async fn mark_timed_out(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.transition(id, RequestStatus::TimedOut, None))
    }

    async fn mark_cancelled(&self, id: &str, reason: Option<&str>) -> Result<bool, StoreError> {
        Ok(self.transition(
            id,
            RequestStatus::Cancelled,
            Some(cancellation_payload(reason)),
        ))
    }

    async fn list_pending(&self, conversation_id: &str) -> Result<Vec<HitlRequest>, StoreError> {
        let mut pending: Vec<HitlRequest> = self
            .requests
            .read()
            .values()
            .filter(|r| {
                r.status == RequestStatus::Pending && r.scope.conversation_id == conversation_id
            })
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }
}
