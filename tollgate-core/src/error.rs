//! Top-level error types for tollgate
//!
//! This module flattens the per-module errors into the categories a caller
//! branches on when a gated tool call fails.

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::events::EmitError;
use crate::hitl::{BuildError, HitlError};
use crate::permission::PermissionError;
use crate::rules::RuleError;
use crate::store::StoreError;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A rule denied the action
    Denied,
    /// A human rejected the action
    Rejected,
    /// Nobody answered and there was no safe default
    TimedOut,
    /// Unknown request id
    NotFound,
    /// Malformed request, rule or reply
    Invalid,
    /// A port (store, emitter, bus) failed
    Unavailable,
    /// Bad configuration or wiring
    Config,
}

/// Top-level error type for tollgate operations
///
/// - [`Error::Denied`] / [`Error::Rejected`] - Do not run the tool call
/// - [`Error::TimedOut`] - Nobody answered; retry or abort the plan
/// - [`Error::Unavailable`] - Infrastructure failed; the request was aborted
/// - [`Error::NotFound`], [`Error::Invalid`], [`Error::Config`] - Caller bugs
#[derive(Debug, Error)]
pub enum Error {
    /// A rule denied the action
    #[error("denied: {0}")]
    Denied(String),

    /// A human rejected the action
    #[error("rejected: {0}")]
    Rejected(String),

    /// Nobody answered in time
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Unknown request
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input
    #[error("invalid: {0}")]
    Invalid(String),

    /// Store, emitter or bus failure
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Denied(_) => ErrorKind::Denied,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true if a rule denied the action
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// Returns true if a human rejected the action
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Returns true if nobody answered in time
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Returns true if the tool call must not run
    ///
    /// Timeouts count: an unanswered ask fails closed.
    pub fn blocks_execution(&self) -> bool {
        matches!(
            self,
            Self::Denied(_) | Self::Rejected(_) | Self::TimedOut(_)
        )
    }
}

impl From<PermissionError> for Error {
    fn from(err: PermissionError) -> Self {
        match err {
            PermissionError::Denied { .. } => Self::Denied(err.to_string()),
            PermissionError::Rejected { .. } => Self::Rejected(err.to_string()),
            PermissionError::TimedOut { .. } => Self::TimedOut(err.to_string()),
            PermissionError::RequestNotFound(id) => Self::NotFound(id),
            PermissionError::UnknownReply(_) | PermissionError::Rule(_) => {
                Self::Invalid(err.to_string())
            }
            PermissionError::Announce(e) => Self::Unavailable(e.to_string()),
        }
    }
}

impl From<HitlError> for Error {
    fn from(err: HitlError) -> Self {
        match err {
            HitlError::Denied { timed_out: true, .. } => Self::TimedOut(err.to_string()),
            HitlError::Denied { .. } => Self::Denied(err.to_string()),
            HitlError::InvalidRequest { .. } | HitlError::UnknownInteractionType(_) => {
                Self::Invalid(err.to_string())
            }
            HitlError::RequestNotFound(id) => Self::NotFound(id),
            HitlError::Persist(_)
            | HitlError::Announce(_)
            | HitlError::Store(_)
            | HitlError::Bus(_) => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<RuleError> for Error {
    fn from(err: RuleError) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<EmitError> for Error {
    fn from(err: EmitError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<BuildError> for Error {
    fn from(err: BuildError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for tollgate operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::InteractionType;

    #[test]
    fn test_blocks_execution() {
        assert!(Error::Denied("x".into()).blocks_execution());
        assert!(Error::Rejected("x".into()).blocks_execution());
        assert!(Error::TimedOut("x".into()).blocks_execution());

        assert!(!Error::Unavailable("store down".into()).blocks_execution());
        assert!(!Error::Config("missing store".into()).blocks_execution());
    }

    #[test]
    fn test_from_permission_error() {
        let err: Error = PermissionError::Denied {
            permission: "bash".into(),
            pattern: "rm -rf /".into(),
        }
        .into();
        assert!(err.is_denied());
        assert!(err.to_string().contains("rm -rf /"));

        let err: Error = PermissionError::Rejected {
            request_id: "per_1".into(),
            message: None,
        }
        .into();
        assert!(err.is_rejected());
        assert_eq!(err.kind(), ErrorKind::Rejected);

        let err: Error = PermissionError::TimedOut {
            request_id: "per_1".into(),
        }
        .into();
        assert!(err.is_timed_out());

        let err: Error = PermissionError::RequestNotFound("per_2".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_from_hitl_error() {
        let err: Error = HitlError::Denied {
            request_id: "hitl_1".into(),
            reason: "timed out".into(),
            timed_out: true,
        }
        .into();
        assert!(err.is_timed_out());

        let err: Error = HitlError::Denied {
            request_id: "hitl_1".into(),
            reason: "shutdown".into(),
            timed_out: false,
        }
        .into();
        assert!(err.is_denied());

        let err: Error = HitlError::InvalidRequest {
            interaction_type: InteractionType::Decision,
            reason: "no options given".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let err: Error = HitlError::Persist(StoreError::Storage("disk full".into())).into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_from_build_error() {
        let err: Error = BuildError::MissingStore.into();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
