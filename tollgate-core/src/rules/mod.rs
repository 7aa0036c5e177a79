//! Permission rules and their evaluation.
//!
//! - **[`PermissionRule`]**: permission glob, target glob, [`Action`], optional
//!   scope tag and structured-argument condition
//! - **[`Ruleset`]**: ordered rule list where later entries win
//! - **[`evaluate`]**: last-match-wins lookup across layered rulesets
//! - **[`Mode`]**: canned rule layers for build/plan/explore agents
//!
//! # Layering
//!
//! | Layer | Owner | Typical content |
//! |-------|-------|-----------------|
//! | base | configuration | project-wide defaults |
//! | mode | [`Mode::ruleset`] | read-only restrictions |
//! | approved | user replies | rules recorded by "always" |

mod evaluate;
mod mode;
mod rule;

pub use evaluate::{
    effective_permission, evaluate, evaluate_with_args, get_disabled_tools, EDIT_TOOLS,
};
pub use mode::{Mode, INTERACTION_PERMISSIONS};
pub use rule::{Action, PermissionRule, RuleError, Ruleset};
