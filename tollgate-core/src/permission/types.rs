//! Permission request and reply types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::events::EmitError;
use crate::rules::RuleError;

/// A human's answer to a pending permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    /// Approve this request only.
    Once,
    /// Approve and remember the request's `always` patterns.
    Always,
    /// Deny, cascading to every pending request of the session.
    Reject,
}

impl Reply {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Once => "once",
            Reply::Always => "always",
            Reply::Reject => "reject",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reply {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Reply::Once),
            "always" => Ok(Reply::Always),
            "reject" => Ok(Reply::Reject),
            other => Err(PermissionError::UnknownReply(other.to_string())),
        }
    }
}

/// Input to [`PermissionManager::ask`](super::PermissionManager::ask).
///
/// # Example
/// ```
/// use tollgate_core::permission::AskRequest;
///
/// let ask = AskRequest::new("session-1", "bash", ["git status", "git diff"])
///     .with_always(["git *"])
///     .with_metadata(serde_json::json!({"tool": "bash"}));
/// assert_eq!(ask.patterns.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AskRequest {
    /// Session the request belongs to
    pub session_id: String,
    /// Permission being asked for
    pub permission: String,
    /// Targets, evaluated in order
    pub patterns: Vec<String>,
    /// Patterns memoized by an "always" reply. Empty records no rule.
    pub always: Vec<String>,
    /// Opaque context forwarded to the asked event
    pub metadata: Value,
    /// Structured tool arguments checked by argument rules
    pub arguments: Option<Map<String, Value>>,
}

impl AskRequest {
    /// Create a request for one or more targets.
    pub fn new<I, S>(
        session_id: impl Into<String>,
        permission: impl Into<String>,
        patterns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            session_id: session_id.into(),
            permission: permission.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            always: Vec::new(),
            metadata: Value::Object(Map::new()),
            arguments: None,
        }
    }

    /// Set the patterns an "always" reply records.
    pub fn with_always<I, S>(mut self, always: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.always = always.into_iter().map(Into::into).collect();
        self
    }

    /// Attach opaque metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach structured tool arguments.
    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

/// A suspended permission check awaiting a human reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Correlation id (`per_` prefix)
    pub id: String,
    /// Session the request belongs to
    pub session_id: String,
    /// Permission being asked for
    pub permission: String,
    /// Every target of the originating ask, in order
    pub patterns: Vec<String>,
    /// Patterns an "always" reply records
    pub always: Vec<String>,
    /// Caller metadata
    pub metadata: Value,
    /// Structured arguments, kept for re-evaluation after "always"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    /// When the request was created
    pub created_at: DateTime<Utc>,
}

/// Errors returned by the permission manager.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    /// A rule denied the request outright.
    #[error("Permission '{permission}' denied for '{pattern}'")]
    Denied {
        /// Permission asked for
        permission: String,
        /// Target that matched a deny rule
        pattern: String,
    },

    /// A human rejected the request, or it was rejected by cascade.
    #[error("Permission request {request_id} rejected{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Rejected {
        /// Correlation id of the rejected request
        request_id: String,
        /// Optional feedback from the human
        message: Option<String>,
    },

    /// Nobody replied within the configured window.
    #[error("Permission request {request_id} timed out")]
    TimedOut {
        /// Correlation id
        request_id: String,
    },

    /// No pending request with this id.
    #[error("Permission request not found: {0}")]
    RequestNotFound(String),

    /// Reply name could not be parsed.
    #[error("Unknown reply: {0}")]
    UnknownReply(String),

    /// The asked event could not be published, so nobody would ever reply.
    #[error("Failed to announce permission request: {0}")]
    Announce(#[source] EmitError),

    /// A rule built from reply data was invalid.
    #[error(transparent)]
    Rule(#[from] RuleError),
}

impl PermissionError {
    /// True for rule denials and human rejections.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            PermissionError::Denied { .. } | PermissionError::Rejected { .. }
        )
    }
}
