//! Notifications about flow pair lifecycle.

use std::fmt;

use super::key::FlowKey;
use super::short_flow::{EvictReason, FlowState};

/// Published on the agent's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    PairCreated {
        forward: FlowKey,
        reverse: FlowKey,
        state: FlowState,
    },
    PairDeleted {
        forward: FlowKey,
        reverse: FlowKey,
        reason: EvictReason,
    },
    StateChanged {
        forward: FlowKey,
        reverse: FlowKey,
        from: FlowState,
        to: FlowState,
    },
}

impl FlowEvent {
    /// Forward key of the pair the event is about.
    pub fn forward(&self) -> &FlowKey {
        match self {
            FlowEvent::PairCreated { forward, .. }
            | FlowEvent::PairDeleted { forward, .. }
            | FlowEvent::StateChanged { forward, .. } => forward,
        }
    }
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowEvent::PairCreated {
                forward,
                reverse,
                state,
            } => write!(f, "created [{}] <-> [{}] {}", forward, reverse, state),
            FlowEvent::PairDeleted {
                forward,
                reverse,
                reason,
            } => write!(f, "deleted [{}] <-> [{}] ({})", forward, reverse, reason),
            FlowEvent::StateChanged {
                forward, from, to, ..
            } => write!(f, "[{}] {} -> {}", forward, from, to),
        }
    }
}
