//! Route keys and published forwarding decisions.

use std::fmt;
use vrouter_types::{IpPrefix, VrfId};

use super::nexthop::NextHop;

/// A key identifying a route (VRF + IP prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// Routing table the route lives in.
    pub vrf: VrfId,
    /// Destination prefix (e.g., 0.0.0.0/0).
    pub prefix: IpPrefix,
}

impl RouteKey {
    pub fn new(vrf: VrfId, prefix: IpPrefix) -> Self {
        Self { vrf, prefix }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vrf:{}/{}", self.vrf, self.prefix)
    }
}

/// The active decision for a route at one generation.
///
/// Decisions are immutable once published. Any mutation of the route
/// (replacement, member add/remove/reorder) publishes a new decision with a
/// strictly larger generation, so holders can detect staleness by comparing
/// generations against the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub route: RouteKey,
    pub generation: u64,
    pub next_hop: NextHop,
}

impl RouteDecision {
    pub fn new(route: RouteKey, generation: u64, next_hop: NextHop) -> Self {
        Self {
            route,
            generation,
            next_hop,
        }
    }
}

impl fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} -> {}", self.route, self.generation, self.next_hop)
    }
}
