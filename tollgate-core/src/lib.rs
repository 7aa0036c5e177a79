//! # Tollgate
//!
//! Gate an agent's tool calls on policy rules and human decisions.
//!
//! Tollgate has two cooperating halves:
//!
//! - **Permission policy**: a [`PermissionManager`] evaluates layered
//!   [`rules`] and suspends on the ones that ask, until a human replies
//!   `once`, `always` or `reject`.
//! - **Human-in-the-loop**: a [`HitlCoordinator`] per conversation asks
//!   clarification, decision, environment-value and permission questions,
//!   waits for the answer from any process, and degrades to a safe default
//!   when nobody answers.
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate_core::permission::{AskRequest, PermissionManager};
//! use tollgate_core::rules::{Action, Ruleset};
//!
//! # tokio_test::block_on(async {
//! let rules = Ruleset::from_entries([
//!     ("*", "*", Action::Allow),
//!     ("bash", "rm *", Action::Deny),
//! ])
//! .unwrap();
//! let manager = PermissionManager::builder().with_base_rules(rules).build();
//!
//! manager.ask(AskRequest::new("s1", "bash", ["ls"])).await.unwrap();
//!
//! let err = manager
//!     .ask(AskRequest::new("s1", "bash", ["rm -rf /"]))
//!     .await
//!     .unwrap_err();
//! assert!(tollgate_core::Error::from(err).is_denied());
//! # });
//! ```
//!
//! ## Ports
//!
//! The core talks to the outside world through three traits:
//!
//! | Port | Purpose | In-process adapter |
//! |------|---------|--------------------|
//! | [`RequestStore`] | durable HITL requests | [`MemoryRequestStore`] |
//! | [`EventEmitter`] | announcements | [`BroadcastEmitter`] |
//! | [`MessageBus`] | cross-process responses | [`MemoryMessageBus`] |
//!
//! ## Feature Flags
//!
//! - `test-utils` - Recording emitter and failing store for tests

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod hitl;
pub mod permission;
pub mod rules;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{BusError, BusResponder, MemoryMessageBus, MessageBus, ResponseListener};
pub use config::{
    load_config_file, ConfigError, HitlConfig, ListenerConfig, PermissionConfig, TollgateConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use events::{BroadcastEmitter, EmitError, EventEmitter, NoopEmitter, TollgateEvent};
pub use hitl::{
    ConversationScope, HitlCoordinator, HitlError, HitlRequest, InteractionType,
    RequestDirectory,
};
pub use permission::{AskRequest, PermissionError, PermissionManager, Reply};
pub use rules::{Action, Mode, PermissionRule, Ruleset};
pub use store::{MemoryRequestStore, RequestStore, StoreError};
