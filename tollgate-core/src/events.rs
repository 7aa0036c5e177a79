//! Events announced to external listeners.
//!
//! The core never talks to a UI directly. Every request it creates is
//! announced through an [`EventEmitter`], and every permission reply is
//! echoed back the same way.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::hitl::{
    ClarificationData, DecisionData, EnvVarData, HitlPayload, HitlRequest, PermissionData,
};
use crate::permission::Reply;

/// Events emitted by the permission manager and HITL coordinators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TollgateEvent {
    // ===== Permission Manager =====
    /// A rule evaluated to Ask and a request is now pending.
    PermissionAsked {
        /// Correlation id of the pending request
        request_id: String,
        /// Session the request belongs to
        session_id: String,
        /// Permission being asked for
        permission: String,
        /// Target patterns covered by this request
        patterns: Vec<String>,
        /// Patterns that "always" would memoize
        always: Vec<String>,
        /// Caller-supplied context
        metadata: Value,
    },

    /// A pending request was resolved.
    PermissionReplied {
        /// Correlation id of the resolved request
        request_id: String,
        /// Session the request belonged to
        session_id: String,
        /// The reply that resolved it
        reply: Reply,
        /// Set when an "always" reply elsewhere approved this request
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_approved: Option<bool>,
    },

    // ===== HITL Interactions =====
    /// A clarification question awaits an answer.
    ClarificationAsked {
        /// Correlation id
        request_id: String,
        /// How long the agent will wait
        timeout_seconds: f64,
        /// Question and options
        #[serde(flatten)]
        data: ClarificationData,
    },

    /// A decision awaits a choice.
    DecisionAsked {
        /// Correlation id
        request_id: String,
        /// How long the agent will wait
        timeout_seconds: f64,
        /// Question and options
        #[serde(flatten)]
        data: DecisionData,
    },

    /// Environment values are being collected.
    EnvVarAsked {
        /// Correlation id
        request_id: String,
        /// How long the agent will wait
        timeout_seconds: f64,
        /// Field specs to collect
        #[serde(flatten)]
        data: EnvVarData,
    },

    /// A tool action awaits explicit approval.
    PermissionRequestAsked {
        /// Correlation id
        request_id: String,
        /// How long the agent will wait
        timeout_seconds: f64,
        /// Tool, action and risk description
        #[serde(flatten)]
        data: PermissionData,
    },
}

impl TollgateEvent {
    /// The "asked" announcement for a HITL request.
    pub fn asked(request: &HitlRequest) -> Self {
        let request_id = request.id.clone();
        let timeout_seconds = request.timeout().as_secs_f64();
        match &request.payload {
            HitlPayload::Clarification(data) => TollgateEvent::ClarificationAsked {
                request_id,
                timeout_seconds,
                data: data.clone(),
            },
            HitlPayload::Decision(data) => TollgateEvent::DecisionAsked {
                request_id,
                timeout_seconds,
                data: data.clone(),
            },
            HitlPayload::EnvVar(data) => TollgateEvent::EnvVarAsked {
                request_id,
                timeout_seconds,
                data: data.clone(),
            },
            HitlPayload::Permission(data) => TollgateEvent::PermissionRequestAsked {
                request_id,
                timeout_seconds,
                data: data.clone(),
            },
        }
    }

    /// The `type` tag this event serializes with.
    pub fn event_type(&self) -> &'static str {
        match self {
            TollgateEvent::PermissionAsked { .. } => "permission_asked",
            TollgateEvent::PermissionReplied { .. } => "permission_replied",
            TollgateEvent::ClarificationAsked { .. } => "clarification_asked",
            TollgateEvent::DecisionAsked { .. } => "decision_asked",
            TollgateEvent::EnvVarAsked { .. } => "env_var_asked",
            TollgateEvent::PermissionRequestAsked { .. } => "permission_request_asked",
        }
    }

    /// Correlation id carried by the event.
    pub fn request_id(&self) -> &str {
        match self {
            TollgateEvent::PermissionAsked { request_id, .. }
            | TollgateEvent::PermissionReplied { request_id, .. }
            | TollgateEvent::ClarificationAsked { request_id, .. }
            | TollgateEvent::DecisionAsked { request_id, .. }
            | TollgateEvent::EnvVarAsked { request_id, .. }
            | TollgateEvent::PermissionRequestAsked { request_id, .. } => request_id,
        }
    }
}

/// Errors raised when an event cannot be published.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The transport refused or dropped the event.
    #[error("Failed to publish event: {0}")]
    Publish(String),

    /// The event could not be serialized.
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An event as it crosses the emitter port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedEvent {
    /// The `type` tag
    pub event_type: String,
    /// Conversation (or permission session) the event belongs to
    pub conversation_id: String,
    /// Full serialized event, including `type`
    pub payload: Value,
}

impl PublishedEvent {
    /// `requestId` field of the payload, if present.
    pub fn request_id(&self) -> Option<&str> {
        self.payload.get("requestId").and_then(Value::as_str)
    }
}

/// Outbound port for announcements.
///
/// Publishing is fire-and-forget for the core except the first "asked"
/// emission of a request, whose failure aborts the request.
///
/// # Example
/// ```
/// use tollgate_core::events::{EventEmitter, PublishedEvent};
///
/// let logger = |event: &PublishedEvent| {
///     println!("{} -> {}", event.conversation_id, event.event_type);
/// };
///
/// # tokio_test::block_on(async {
/// logger
///     .publish("permission_asked", "session-1", serde_json::json!({}))
///     .await
///     .unwrap();
/// # });
/// ```
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Publish one event.
    async fn publish(
        &self,
        event_type: &str,
        conversation_id: &str,
        payload: Value,
    ) -> Result<(), EmitError>;
}

/// Blanket implementation for closures
#[async_trait]
impl<F> EventEmitter for F
where
    F: Fn(&PublishedEvent) + Send + Sync,
{
    async fn publish(
        &self,
        event_type: &str,
        conversation_id: &str,
        payload: Value,
    ) -> Result<(), EmitError> {
        self(&PublishedEvent {
            event_type: event_type.to_string(),
            conversation_id: conversation_id.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Serialize a typed event and push it through an emitter.
pub(crate) async fn emit(
    emitter: &dyn EventEmitter,
    conversation_id: &str,
    event: &TollgateEvent,
) -> Result<(), EmitError> {
    let payload = serde_json::to_value(event)?;
    emitter
        .publish(event.event_type(), conversation_id, payload)
        .await
}

/// Emitter that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmitter;

#[async_trait]
impl EventEmitter for NoopEmitter {
    async fn publish(&self, _: &str, _: &str, _: Value) -> Result<(), EmitError> {
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
///
/// Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<PublishedEvent>,
}

impl BroadcastEmitter {
    /// Create an emitter buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventEmitter for BroadcastEmitter {
    async fn publish(
        &self,
        event_type: &str,
        conversation_id: &str,
        payload: Value,
    ) -> Result<(), EmitError> {
        let event = PublishedEvent {
            event_type: event_type.to_string(),
            conversation_id: conversation_id.to_string(),
            payload,
        };
        if self.sender.send(event).is_err() {
            log::debug!("No subscribers for {} event", event_type);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_permission_asked_shape() {
        let event = TollgateEvent::PermissionAsked {
            request_id: "per_1".into(),
            session_id: "s1".into(),
            permission: "bash".into(),
            patterns: vec!["rm -rf /".into()],
            always: vec!["rm *".into()],
            metadata: json!({"tool": "bash"}),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "permission_asked");
        assert_eq!(value["requestId"], "per_1");
        assert_eq!(value["patterns"], json!(["rm -rf /"]));
        assert_eq!(value["metadata"]["tool"], "bash");
        assert_eq!(event.event_type(), "permission_asked");
    }

    #[test]
    fn test_permission_replied_omits_auto_flag() {
        let event = TollgateEvent::PermissionReplied {
            request_id: "per_1".into(),
            session_id: "s1".into(),
            reply: Reply::Once,
            auto_approved: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["reply"], "once");
        assert_eq!(value["sessionId"], "s1");
        assert!(value.get("autoApproved").is_none());

        let auto = TollgateEvent::PermissionReplied {
            request_id: "per_2".into(),
            session_id: "s1".into(),
            reply: Reply::Always,
            auto_approved: Some(true),
        };
        let value = serde_json::to_value(&auto).unwrap();
        assert_eq!(value["autoApproved"], true);
    }

    #[test]
    fn test_clarification_asked_flattens_payload() {
        let event = TollgateEvent::ClarificationAsked {
            request_id: "hitl_1".into(),
            timeout_seconds: 300.0,
            data: ClarificationData {
                question: "Which database?".into(),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "clarification_asked");
        assert_eq!(value["timeoutSeconds"], 300.0);
        assert_eq!(value["question"], "Which database?");
        assert_eq!(event.request_id(), "hitl_1");
    }

    #[test]
    fn test_asked_event_for_request() {
        use crate::hitl::{ConversationScope, EnvVarField};
        use std::time::Duration;

        let request = HitlRequest::new(
            "hitl_9",
            &ConversationScope::new("conv", "t", "p"),
            HitlPayload::EnvVar(EnvVarData {
                tool_name: "github".into(),
                fields: vec![EnvVarField::new("GITHUB_TOKEN")],
                message: None,
            }),
            Duration::from_secs(600),
        );

        let value = serde_json::to_value(TollgateEvent::asked(&request)).unwrap();
        assert_eq!(value["type"], "env_var_asked");
        assert_eq!(value["requestId"], "hitl_9");
        assert_eq!(value["timeoutSeconds"], 600.0);
        assert_eq!(value["tool_name"], "github");
        assert_eq!(value["fields"][0]["name"], "GITHUB_TOKEN");
    }

    #[tokio::test]
    async fn test_closure_emitter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let emitter = move |event: &PublishedEvent| {
            sink.lock().unwrap().push(event.clone());
        };

        emitter
            .publish("decision_asked", "conv", json!({"requestId": "x"}))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].request_id(), Some("x"));
    }

    #[tokio::test]
    async fn test_broadcast_emitter() {
        let emitter = BroadcastEmitter::default();
        // No subscribers is fine
        emitter.publish("a", "c", json!({})).await.unwrap();

        let mut rx = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 1);
        emitter.publish("b", "c", json!({"n": 1})).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "b");
        assert_eq!(event.payload["n"], 1);
    }
}
