//! Pair lifecycle states.
//!
//! ```text
//!            resolve ok                 resolve failed
//!   (new) ─────────────▶ Active ◀────────────────────▶ ShortFlow
//!                          │      later packet ok          │
//!                          └──────────┬────────────────────┘
//!                                     ▼ sweep / teardown
//!                                  Evicted
//! ```
//!
//! A short flow is handled conservatively by the dataplane; it never carries
//! a guessed forwarding decision.

use std::fmt;

use super::resolver::ResolveError;

/// Why a pair is a short flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShortFlowReason {
    /// No route for the destination in its own table.
    DestinationUnresolved,
    /// A redirect or translation pointed at a target with no route.
    RedirectChainIncomplete,
}

impl From<&ResolveError> for ShortFlowReason {
    fn from(err: &ResolveError) -> Self {
        match err {
            ResolveError::DestinationUnresolved { .. } => ShortFlowReason::DestinationUnresolved,
            ResolveError::RedirectChainIncomplete { .. } => {
                ShortFlowReason::RedirectChainIncomplete
            }
        }
    }
}

impl fmt::Display for ShortFlowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShortFlowReason::DestinationUnresolved => write!(f, "destination unresolved"),
            ShortFlowReason::RedirectChainIncomplete => write!(f, "redirect chain incomplete"),
        }
    }
}

/// Why a pair was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictReason {
    IdleTimeout,
    /// Explicit teardown by the caller.
    Invalidated,
    /// The route the pair depended on was withdrawn.
    RouteWithdrawn,
    /// The pair's table was deleted.
    TableRemoved,
    /// A new conversation claimed one of the pair's keys.
    Replaced,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvictReason::IdleTimeout => "idle timeout",
            EvictReason::Invalidated => "invalidated",
            EvictReason::RouteWithdrawn => "route withdrawn",
            EvictReason::TableRemoved => "table removed",
            EvictReason::Replaced => "replaced",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state shared by both records of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    Active,
    ShortFlow(ShortFlowReason),
    Evicted(EvictReason),
}

impl FlowState {
    /// State produced by the first resolution of a new pair.
    pub fn initial(outcome: Option<ShortFlowReason>) -> Self {
        match outcome {
            None => FlowState::Active,
            Some(reason) => FlowState::ShortFlow(reason),
        }
    }

    /// Applies the outcome of a resolution. `None` means both directions
    /// resolved. Evicted is terminal.
    pub fn on_resolution(self, outcome: Option<ShortFlowReason>) -> Self {
        match self {
            FlowState::Evicted(_) => self,
            _ => Self::initial(outcome),
        }
    }

    pub fn evict(self, reason: EvictReason) -> Self {
        match self {
            FlowState::Evicted(_) => self,
            _ => FlowState::Evicted(reason),
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(self, FlowState::ShortFlow(_))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, FlowState::Active)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Active => write!(f, "active"),
            FlowState::ShortFlow(reason) => write!(f, "short ({})", reason),
            FlowState::Evicted(reason) => write!(f, "evicted ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_transitions() {
        let state = FlowState::initial(None);
        assert_eq!(state, FlowState::Active);

        let state = state.on_resolution(Some(ShortFlowReason::RedirectChainIncomplete));
        assert!(state.is_short());

        let state = state.on_resolution(None);
        assert!(state.is_active());

        let state = state.evict(EvictReason::IdleTimeout);
        assert_eq!(state, FlowState::Evicted(EvictReason::IdleTimeout));
        assert_eq!(
            state.on_resolution(None),
            FlowState::Evicted(EvictReason::IdleTimeout)
        );
        assert_eq!(
            state.evict(EvictReason::Invalidated),
            FlowState::Evicted(EvictReason::IdleTimeout)
        );
    }

    #[test]
    fn test_initial_short() {
        let state = FlowState::initial(Some(ShortFlowReason::DestinationUnresolved));
        assert_eq!(
            state,
            FlowState::ShortFlow(ShortFlowReason::DestinationUnresolved)
        );
        assert_eq!(state.to_string(), "short (destination unresolved)");
    }
}
