use log::{debug, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::{BusError, BusMessage, MessageBus};
use crate::config::ListenerConfig;
use crate::hitl::RequestDirectory;

/// Consumes one request's response stream and routes payloads to the waiter.
///
/// On start the listener ensures its consumer group, then claims messages
/// a crashed consumer left unacknowledged, then long-polls for new ones.
/// Every delivered message is acknowledged whether or not it resolved the
/// request, so redeliveries after the first resolution are dropped. The
/// loop ends once the request has left the directory.
pub struct ResponseListener {
    bus: Arc<dyn MessageBus>,
    directory: Arc<RequestDirectory>,
    config: ListenerConfig,
}

impl ResponseListener {
    /// Create a listener.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        directory: Arc<RequestDirectory>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            bus,
            directory,
            config,
        }
    }

    /// Run [`listen`](Self::listen) on a new task.
    pub fn spawn(self, request_id: impl Into<String>) -> JoinHandle<()> {
        let request_id = request_id.into();
        tokio::spawn(async move { self.listen(&request_id).await })
    }

    /// Deliver responses for `request_id` until it is resolved or unregistered.
    pub async fn listen(&self, request_id: &str) {
        let group = self.config.consumer_group.as_str();

        if let Err(e) = self.bus.create_group(request_id, group).await {
            warn!("Failed to create consumer group for {}: {}", request_id, e);
        }

        if self.recover(request_id).await {
            self.finish(request_id).await;
            return;
        }

        while self.directory.contains(request_id) {
            let read = self
                .bus
                .read_group(
                    request_id,
                    group,
                    &self.config.consumer_name,
                    self.config.batch_size,
                    self.config.block,
                )
                .await;

            match read {
                Ok(messages) if messages.is_empty() => continue,
                Ok(messages) => {
                    if self.deliver(request_id, messages).await {
                        self.finish(request_id).await;
                        return;
                    }
                }
                Err(BusError::GroupNotFound { .. }) => {
                    // Stream deleted under us, e.g. by the waiting side's cleanup
                    debug!("Response stream for {} is gone", request_id);
                    if !self.directory.contains(request_id) {
                        return;
                    }
                    if let Err(e) = self.bus.create_group(request_id, group).await {
                        warn!("Failed to recreate consumer group for {}: {}", request_id, e);
                        tokio::time::sleep(self.config.block).await;
                    }
                }
                Err(e) => {
                    warn!("Failed to read responses for {}: {}", request_id, e);
                    tokio::time::sleep(self.config.block).await;
                }
            }
        }
    }

    /// Claim and deliver messages idle past the threshold.
    async fn recover(&self, request_id: &str) -> bool {
        let group = self.config.consumer_group.as_str();
        let stale: Vec<String> = match self.bus.pending(request_id, group).await {
            Ok(pending) => pending
                .into_iter()
                .filter(|p| p.idle >= self.config.claim_min_idle)
                .map(|p| p.message_id)
                .collect(),
            Err(e) => {
                debug!("No pending list for {}: {}", request_id, e);
                return false;
            }
        };
        if stale.is_empty() {
            return false;
        }

        match self
            .bus
            .claim(
                request_id,
                group,
                &self.config.consumer_name,
                self.config.claim_min_idle,
                &stale,
            )
            .await
        {
            Ok(messages) => {
                debug!(
                    "Claimed {} stale response(s) for {}",
                    messages.len(),
                    request_id
                );
                self.deliver(request_id, messages).await
            }
            Err(e) => {
                warn!("Failed to claim stale responses for {}: {}", request_id, e);
                false
            }
        }
    }

    async fn deliver(&self, request_id: &str, messages: Vec<BusMessage>) -> bool {
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();

        let mut resolved = false;
        for message in messages {
            if self
                .directory
                .resolve_by_request_id(request_id, message.payload)
            {
                resolved = true;
            } else {
                debug!(
                    "Ignoring response {} for {} (delivery {})",
                    message.id, request_id, message.delivery_count
                );
            }
        }

        if let Err(e) = self
            .bus
            .ack(request_id, &self.config.consumer_group, &ids)
            .await
        {
            warn!("Failed to acknowledge responses for {}: {}", request_id, e);
        }
        resolved
    }

    async fn finish(&self, request_id: &str) {
        if let Err(e) = self.bus.delete_stream(request_id).await {
            warn!("Failed to delete response stream for {}: {}", request_id, e);
        }
    }
}
