//! Router Layer
//!
//! Responsibilities:
//! - Map a Destination to an outbound tag
//! - Remember decisions for a fixed validity window
//! - NO IO operations
//!
//! A decision is either a tag or `NoRuleApplicable`; both are cached.

mod cache;
mod rule;
mod rule_router;

pub use cache::ValidityMap;
pub use rule::{CompiledRule, Rule};
pub use rule_router::{RuleRouter, DEFAULT_CACHE_TTL};

use crate::common::{Destination, Result};

/// Router trait - picks the outbound for a destination
///
/// Must not perform IO. Errors with `NoRuleApplicable` when nothing matches.
pub trait Router: Send + Sync {
    fn take_detour(&self, destination: &Destination) -> Result<String>;
}
