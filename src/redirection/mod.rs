//! Versioned, conflict-checked redirection table.

mod registry;
mod rule;

pub use registry::{RedirectionRegistry, RedirectionSnapshot};
pub use rule::{RedirectionRule, RedirectionTarget, RouteCondition, RouteContext};

use thiserror::Error;
use uuid::Uuid;

use crate::types::CapabilityName;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedirectionError {
    /// The rule is malformed on its own.
    #[error("invalid redirection rule {rule}: {reason}")]
    Validation { rule: Uuid, reason: String },

    /// The rule overlaps an existing rule on the same capability.
    #[error("redirection rule {incoming} conflicts with rule {existing} on capability {capability}")]
    Conflict {
        incoming: Uuid,
        existing: Uuid,
        capability: CapabilityName,
    },
}
