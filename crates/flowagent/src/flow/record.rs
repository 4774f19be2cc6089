//! Flow records and the views exposed to the dataplane.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use vrouter_common::Handle;

use super::key::{FlowKey, IngressContext, TunnelOrigin};
use super::resolver::ResolveError;
use super::short_flow::FlowState;
use crate::redirect::LookupTarget;
use crate::route::RouteDecision;

/// Position of the ECMP member a flow's traffic arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberIndex(u32);

impl MemberIndex {
    /// No member: locally originated traffic, a single-path route, or an
    /// origin that is not a member of the group.
    pub const NONE: Self = Self(u32::MAX);

    pub fn new(index: usize) -> Self {
        u32::try_from(index)
            .ok()
            .filter(|i| *i != u32::MAX)
            .map_or(Self::NONE, Self)
    }

    pub fn get(&self) -> Option<usize> {
        if self.is_none() {
            None
        } else {
            Some(self.0 as usize)
        }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Default for MemberIndex {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(index) => write!(f, "{}", index),
            None => write!(f, "none"),
        }
    }
}

/// A direction's hold on the decision it forwards with.
#[derive(Debug, Clone)]
pub struct Binding {
    pub generation: u64,
    pub decision: Arc<RouteDecision>,
    /// The (table, address) actually looked up.
    pub target: LookupTarget,
}

impl Binding {
    pub fn new(decision: Arc<RouteDecision>, target: LookupTarget) -> Self {
        Self {
            generation: decision.generation,
            decision,
            target,
        }
    }

    /// Returns true if `current` is the decision this binding holds.
    pub fn matches(&self, current: Option<&Arc<RouteDecision>>) -> bool {
        match current {
            Some(current) => {
                current.route == self.decision.route && current.generation == self.generation
            }
            None => false,
        }
    }
}

/// Which half of a pair a record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The direction of the packet that created the pair.
    Forward,
    Reverse,
}

/// One direction of a conversation.
///
/// Records are owned by their partition's flow table and reference their
/// partner only by handle.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub(crate) key: FlowKey,
    pub(crate) direction: Direction,
    pub(crate) paired: Handle,
    pub(crate) member_index: MemberIndex,
    pub(crate) binding: Option<Binding>,
    pub(crate) failure: Option<ResolveError>,
    pub(crate) state: FlowState,
    pub(crate) last_seen: Instant,
    pub(crate) tunnel_origin: Option<TunnelOrigin>,
    pub(crate) ingress: IngressContext,
    pub(crate) needs_refresh: bool,
}

impl FlowRecord {
    pub(crate) fn new(
        key: FlowKey,
        direction: Direction,
        paired: Handle,
        ingress: IngressContext,
        tunnel_origin: Option<TunnelOrigin>,
        now: Instant,
    ) -> Self {
        Self {
            key,
            direction,
            paired,
            member_index: MemberIndex::NONE,
            binding: None,
            failure: None,
            state: FlowState::Active,
            last_seen: now,
            tunnel_origin,
            ingress,
            needs_refresh: true,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn paired(&self) -> Handle {
        self.paired
    }

    pub fn member_index(&self) -> MemberIndex {
        self.member_index
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn failure(&self) -> Option<&ResolveError> {
        self.failure.as_ref()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn is_short_flow(&self) -> bool {
        self.state.is_short()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn tunnel_origin(&self) -> Option<&TunnelOrigin> {
        self.tunnel_origin.as_ref()
    }

    pub fn ingress(&self) -> &IngressContext {
        &self.ingress
    }
}

/// Snapshot of one record handed to the dataplane-programming side.
#[derive(Debug, Clone)]
pub struct FlowView {
    pub key: FlowKey,
    pub direction: Direction,
    pub member_index: MemberIndex,
    /// Decision this direction forwards with; `None` for a short flow's
    /// unresolved direction.
    pub decision: Option<Arc<RouteDecision>>,
    pub target: Option<LookupTarget>,
    pub short_flow: bool,
    pub state: FlowState,
}

impl FlowView {
    pub fn generation(&self) -> Option<u64> {
        self.decision.as_ref().map(|d| d.generation)
    }
}

impl From<&FlowRecord> for FlowView {
    fn from(record: &FlowRecord) -> Self {
        Self {
            key: record.key,
            direction: record.direction,
            member_index: record.member_index,
            decision: record.binding.as_ref().map(|b| b.decision.clone()),
            target: record.binding.as_ref().map(|b| b.target),
            short_flow: record.state.is_short(),
            state: record.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{NextHop, Path, RouteKey};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_member_index() {
        assert!(MemberIndex::NONE.is_none());
        assert_eq!(MemberIndex::default(), MemberIndex::NONE);
        assert_eq!(MemberIndex::new(3).get(), Some(3));
        assert_eq!(MemberIndex::new(3).to_string(), "3");
        assert_eq!(MemberIndex::NONE.to_string(), "none");
        assert!(MemberIndex::new(u32::MAX as usize).is_none());
    }

    #[test]
    fn test_binding_matches() {
        let route = RouteKey::new(1, "0.0.0.0/0".parse().unwrap());
        let decision = Arc::new(RouteDecision::new(
            route,
            7,
            NextHop::Single(Path::interface("vnet1")),
        ));
        let binding = Binding::new(
            decision.clone(),
            LookupTarget::direct(1, "8.8.8.8".parse().unwrap()),
        );

        assert_eq!(binding.generation, 7);
        assert!(binding.matches(Some(&decision)));
        assert!(!binding.matches(None));

        let newer = Arc::new(RouteDecision::new(route, 8, decision.next_hop.clone()));
        assert!(!binding.matches(Some(&newer)));
    }
}
