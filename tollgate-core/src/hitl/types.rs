//! HITL request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::BusError;
use crate::events::EmitError;
use crate::store::StoreError;

/// The closed set of human interactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    /// Free-form or option-backed question
    Clarification,
    /// Choice between explicit options
    Decision,
    /// Collection of environment values (credentials, endpoints)
    EnvVar,
    /// Explicit approval of a tool action
    Permission,
}

impl InteractionType {
    /// Every variant.
    pub const ALL: [InteractionType; 4] = [
        InteractionType::Clarification,
        InteractionType::Decision,
        InteractionType::EnvVar,
        InteractionType::Permission,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Clarification => "clarification",
            InteractionType::Decision => "decision",
            InteractionType::EnvVar => "env_var",
            InteractionType::Permission => "permission",
        }
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionType {
    type Err = HitlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InteractionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| HitlError::UnknownInteractionType(s.to_string()))
    }
}

/// Identifiers a coordinator is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationScope {
    /// Conversation the agent is running in
    pub conversation_id: String,
    /// Owning tenant
    pub tenant_id: String,
    /// Owning project
    pub project_id: String,
}

impl ConversationScope {
    /// Create a scope.
    pub fn new(
        conversation_id: impl Into<String>,
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
        }
    }
}

/// Lifecycle of a durable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting for a human
    Pending,
    /// A response was recorded
    Answered,
    /// Nobody answered before expiry
    TimedOut,
    /// Cancelled administratively or by the caller
    Cancelled,
}

impl RequestStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Answered => "answered",
            RequestStatus::TimedOut => "timed_out",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "answered" => Ok(RequestStatus::Answered),
            "timed_out" => Ok(RequestStatus::TimedOut),
            "cancelled" => Ok(RequestStatus::Cancelled),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

/// A selectable option for clarification and decision requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionOption {
    /// Value returned when chosen
    pub id: String,
    /// Display label
    pub label: String,
    /// Longer explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Marked as the suggested choice
    #[serde(default)]
    pub recommended: bool,
}

impl InteractionOption {
    /// Create an option.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            recommended: false,
        }
    }

    /// Mark as recommended.
    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }
}

fn default_true() -> bool {
    true
}

/// Payload of a clarification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationData {
    /// The question
    pub question: String,
    /// Suggested answers
    #[serde(default)]
    pub options: Vec<InteractionOption>,
    /// Whether a free-form answer is accepted
    #[serde(default = "default_true")]
    pub allow_custom: bool,
    /// Answer used when nobody responds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Extra context for the human
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl Default for ClarificationData {
    fn default() -> Self {
        Self {
            question: String::new(),
            options: Vec::new(),
            allow_custom: true,
            default_value: None,
            context: None,
        }
    }
}

/// Payload of a decision request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionData {
    /// The question
    pub question: String,
    /// Choices (at least one)
    pub options: Vec<InteractionOption>,
    /// Free-form category, e.g. "architecture"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_type: Option<String>,
    /// Option id used when nobody responds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_option: Option<String>,
    /// Whether an answer outside the options is accepted
    #[serde(default)]
    pub allow_custom: bool,
    /// Extra context for the human
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// A single value to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarField {
    /// Variable name
    pub name: String,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Must be provided
    #[serde(default = "default_true")]
    pub required: bool,
    /// Mask on input
    #[serde(default)]
    pub secret: bool,
    /// Value used when nobody responds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl EnvVarField {
    /// Create a required, non-secret field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            description: None,
            required: true,
            secret: false,
            default_value: None,
        }
    }
}

/// Payload of an environment-value request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVarData {
    /// Tool that needs the values
    pub tool_name: String,
    /// Fields to collect (at least one)
    pub fields: Vec<EnvVarField>,
    /// Message shown above the form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_risk() -> String {
    "medium".to_string()
}

/// Payload of an explicit tool-approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionData {
    /// Tool asking for approval
    pub tool_name: String,
    /// Action the tool will take
    pub action: String,
    /// Free-form risk label
    #[serde(default = "default_risk")]
    pub risk_level: String,
    /// Human-readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tool arguments or other detail
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
    /// Whether "remember this choice" is offered
    #[serde(default = "default_true")]
    pub allow_remember: bool,
    /// "allow" or "deny" applied when nobody responds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_action: Option<String>,
}

impl Default for PermissionData {
    fn default() -> Self {
        Self {
            tool_name: String::new(),
            action: String::new(),
            risk_level: default_risk(),
            description: None,
            details: Value::Null,
            allow_remember: true,
            default_action: None,
        }
    }
}

/// Type-specific payload of a [`HitlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum HitlPayload {
    /// See [`ClarificationData`]
    Clarification(ClarificationData),
    /// See [`DecisionData`]
    Decision(DecisionData),
    /// See [`EnvVarData`]
    EnvVar(EnvVarData),
    /// See [`PermissionData`]
    Permission(PermissionData),
}

impl HitlPayload {
    /// The interaction type this payload belongs to.
    pub fn interaction_type(&self) -> InteractionType {
        match self {
            HitlPayload::Clarification(_) => InteractionType::Clarification,
            HitlPayload::Decision(_) => InteractionType::Decision,
            HitlPayload::EnvVar(_) => InteractionType::EnvVar,
            HitlPayload::Permission(_) => InteractionType::Permission,
        }
    }
}

/// A durable, cross-process human interaction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRequest {
    /// Correlation id
    pub id: String,
    /// Interaction kind
    pub interaction_type: InteractionType,
    /// Owning conversation
    #[serde(flatten)]
    pub scope: ConversationScope,
    /// Type-specific payload
    pub payload: HitlPayload,
    /// Current lifecycle state
    pub status: RequestStatus,
    /// Recorded response, once answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When the waiting side gives up
    pub expires_at: DateTime<Utc>,
}

impl HitlRequest {
    /// Create a pending request expiring `timeout` from now.
    pub fn new(
        id: impl Into<String>,
        scope: &ConversationScope,
        payload: HitlPayload,
        timeout: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: id.into(),
            interaction_type: payload.interaction_type(),
            scope: scope.clone(),
            payload,
            status: RequestStatus::Pending,
            response: None,
            created_at,
            expires_at,
        }
    }

    /// Time between creation and expiry.
    pub fn timeout(&self) -> Duration {
        (self.expires_at - self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    /// True when still pending past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending && now >= self.expires_at
    }
}

/// Errors that can occur during HITL operations
#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    /// Request data did not fit the interaction type
    #[error("Invalid {interaction_type} request: {reason}")]
    InvalidRequest {
        /// Interaction the data was meant for
        interaction_type: InteractionType,
        /// What was wrong
        reason: String,
    },

    /// Unknown interaction type name
    #[error("Unknown interaction type: {0}")]
    UnknownInteractionType(String),

    /// The request could not be persisted, so it was aborted
    #[error("Failed to persist request: {0}")]
    Persist(#[source] StoreError),

    /// The request could not be announced, so it was aborted
    #[error("Failed to announce request: {0}")]
    Announce(#[source] EmitError),

    /// Timed out or cancelled with no safe default
    #[error("Request {request_id} denied: {reason}")]
    Denied {
        /// Correlation id
        request_id: String,
        /// Why it degraded to denial
        reason: String,
        /// Nobody answered, as opposed to an explicit cancellation
        timed_out: bool,
    },

    /// No such request in the store
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    /// Store access failed outside request creation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Message bus failure
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors that can occur when building a coordinator.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No request store configured.
    #[error("No request store configured. Call .with_store() before .build()")]
    MissingStore,

    /// No event emitter configured.
    #[error("No event emitter configured. Call .with_emitter() before .build()")]
    MissingEmitter,

    /// No request directory configured.
    #[error("No request directory configured. Call .with_directory() before .build()")]
    MissingDirectory,
}
