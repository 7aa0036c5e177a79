//! Human-in-the-loop coordination.
//!
//! - **[`HitlCoordinator`]**: per-conversation orchestrator that suspends on a
//!   request until a human answers, the wait times out, or it is cancelled
//! - **[`RequestDirectory`]**: process-wide id to coordinator lookup used by
//!   inbound delivery paths
//! - **[`HitlStrategy`]**: per-type request building, response extraction
//!   and defaults
//!
//! # Timeout behavior
//!
//! | Type | Default wait | On timeout |
//! |------|--------------|------------|
//! | clarification | 300s | `default_value`, else recommended or first option, else `""` |
//! | decision | 300s | `default_option`, else recommended or first option |
//! | env_var | 600s | field defaults |
//! | permission | 300s | `default_action`, else denied |

mod coordinator;
mod directory;
mod strategy;
mod types;

pub use coordinator::{HitlCoordinator, HitlCoordinatorBuilder};
pub use directory::{RequestDirectory, RequestResolver};
pub use strategy::{
    is_cancellation, strategy_for, ClarificationStrategy, DecisionStrategy, EnvVarStrategy,
    HitlStrategy, PermissionStrategy,
};
pub use types::{
    BuildError, ClarificationData, ConversationScope, DecisionData, EnvVarData, EnvVarField,
    HitlError, HitlPayload, HitlRequest, InteractionOption, InteractionType, PermissionData,
    RequestStatus,
};
