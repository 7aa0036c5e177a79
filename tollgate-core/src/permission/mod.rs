//! Permission policy engine.
//!
//! A [`PermissionManager`] evaluates each target of an [`AskRequest`]
//! against three rule layers and suspends on targets that need a human.
//!
//! # Replies
//!
//! | Reply | Effect on target | Effect on session |
//! |-------|------------------|-------------------|
//! | `once` | approved | none |
//! | `always` | approved, `always` patterns recorded | other requests that now evaluate to allow are auto-approved |
//! | `reject` | rejected | every other pending request rejected |

mod manager;
mod types;

pub use manager::{PermissionManager, PermissionManagerBuilder};
pub use types::{AskRequest, PermissionError, PermissionRequest, Reply};
