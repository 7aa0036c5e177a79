use log::debug;
use serde_json::Value;
use std::sync::Arc;

use super::MessageBus;
use crate::hitl::{HitlError, RequestDirectory, RequestStatus};
use crate::store::{cancellation_payload, RequestStore};

/// Records a human's response and delivers it to the waiting coordinator.
///
/// Runs in whichever process receives the reply. The store is updated
/// first, so a request is answered at most once even when several replies
/// race. Delivery goes through the bus, or straight to the waiter when a
/// directory is attached and the waiter lives in this process.
pub struct BusResponder {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn RequestStore>,
    directory: Option<Arc<RequestDirectory>>,
}

impl BusResponder {
    /// Create a responder that always delivers through the bus.
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn RequestStore>) -> Self {
        Self {
            bus,
            store,
            directory: None,
        }
    }

    /// Deliver in-process when the waiter is registered here.
    pub fn with_directory(mut self, directory: Arc<RequestDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Answer a request. Returns `false` if it was already settled.
    pub async fn respond(&self, request_id: &str, payload: Value) -> Result<bool, HitlError> {
        let request = self
            .store
            .get(request_id)
            .await?
            .ok_or_else(|| HitlError::RequestNotFound(request_id.to_string()))?;
        if request.status != RequestStatus::Pending {
            debug!(
                "Request {} already {}, ignoring response",
                request_id,
                request.status.as_str()
            );
            return Ok(false);
        }
        if !self.store.mark_answered(request_id, &payload).await? {
            return Ok(false);
        }

        self.deliver(request_id, payload).await?;
        Ok(true)
    }

    /// Cancel a request. The waiter degrades exactly as on timeout.
    pub async fn cancel(&self, request_id: &str, reason: Option<&str>) -> Result<bool, HitlError> {
        if self.store.get(request_id).await?.is_none() {
            return Err(HitlError::RequestNotFound(request_id.to_string()));
        }
        if !self.store.mark_cancelled(request_id, reason).await? {
            return Ok(false);
        }

        self.deliver(request_id, cancellation_payload(reason)).await?;
        Ok(true)
    }

    async fn deliver(&self, request_id: &str, payload: Value) -> Result<(), HitlError> {
        if let Some(directory) = &self.directory {
            if directory.contains(request_id)
                && directory.resolve_by_request_id(request_id, payload.clone())
            {
                debug!("Delivered response for {} in-process", request_id);
                return Ok(());
            }
        }
        let message_id = self.bus.publish_response(request_id, &payload).await?;
        debug!("Published response {} for {}", message_id, request_id);
        Ok(())
    }
}
