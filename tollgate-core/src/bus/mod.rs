//! Cross-process response delivery.
//!
//! Responses to a HITL request travel over a per-request stream read by a
//! consumer group, giving at-least-once delivery. The core only needs the
//! eight operations of [`MessageBus`]; a stream server such as Redis
//! satisfies them directly, and [`MemoryMessageBus`] satisfies them
//! in-process.
//!
//! - **[`ResponseListener`]**: consumes one request's stream and routes
//!   payloads through the [`RequestDirectory`](crate::hitl::RequestDirectory)
//! - **[`BusResponder`]**: the reply-handler side that records a response
//!   and publishes it

mod listener;
mod memory;
mod responder;

pub use listener::ResponseListener;
pub use memory::MemoryMessageBus;
pub use responder::BusResponder;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Errors from message bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The consumer group does not exist on the stream.
    #[error("Consumer group '{group}' not found on stream '{stream}'")]
    GroupNotFound {
        /// Stream (request id)
        stream: String,
        /// Group name
        group: String,
    },

    /// The stream does not exist.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// The transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Stream-assigned id, increasing within a stream
    pub id: String,
    /// Response payload
    pub payload: Value,
    /// Times this message has been delivered, including this one
    pub delivery_count: u32,
}

/// A delivered but unacknowledged message.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Message id
    pub message_id: String,
    /// Consumer currently owning the message
    pub consumer: String,
    /// Time since last delivery
    pub idle: Duration,
    /// Times delivered
    pub delivery_count: u32,
}

/// Reliable-delivery port, one stream per request id.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a response to the request's stream. Returns the message id.
    async fn publish_response(&self, request_id: &str, payload: &Value) -> Result<String, BusError>;

    /// Read messages never delivered to the group, waiting up to `block`
    /// when none are available.
    async fn read_group(
        &self,
        request_id: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Acknowledge messages. Returns how many were pending.
    async fn ack(&self, request_id: &str, group: &str, message_ids: &[String])
        -> Result<usize, BusError>;

    /// Create the group reading from the start of the stream, creating the
    /// stream if needed. Succeeds if the group already exists.
    async fn create_group(&self, request_id: &str, group: &str) -> Result<(), BusError>;

    /// Unacknowledged messages of the group, oldest first.
    async fn pending(&self, request_id: &str, group: &str) -> Result<Vec<PendingMessage>, BusError>;

    /// Take ownership of pending messages idle for at least `min_idle`.
    async fn claim(
        &self,
        request_id: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        message_ids: &[String],
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Keep at most `max_len` newest messages. Returns how many were removed.
    async fn trim(&self, request_id: &str, max_len: usize) -> Result<usize, BusError>;

    /// Remove the stream and its groups. Returns `false` if it did not exist.
    async fn delete_stream(&self, request_id: &str) -> Result<bool, BusError>;
}
