//! Resolution of a flow pair against current route state.
//!
//! Each direction's key is run through the redirect chain and the resulting
//! target is looked up in the route snapshot. A direction whose target has
//! no route fails; the resolver never falls back to the untranslated or
//! unredirected destination.
//!
//! The member index of a record is the position, within the decision bound
//! by its partner, of the peer the record's traffic arrived from. The
//! partner's decision is the route back toward that peer.

use log::debug;
use std::sync::Arc;
use vrouter_types::{IpAddress, VrfId};

use super::key::{FlowKey, IngressContext, TunnelOrigin};
use super::record::{Binding, MemberIndex};
use super::short_flow::ShortFlowReason;
use crate::redirect::RedirectChain;
use crate::route::{RouteDecision, RouteSnapshotProvider};

/// Why a direction could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no route for {address} in vrf {vrf}")]
    DestinationUnresolved { vrf: VrfId, address: IpAddress },

    #[error("no route for {address} in vrf {vrf} (substituted for vrf {original_vrf})")]
    RedirectChainIncomplete {
        /// Table of the flow key before redirection.
        original_vrf: VrfId,
        vrf: VrfId,
        address: IpAddress,
    },
}

/// Per-direction input to a pair resolution.
#[derive(Debug, Clone, Copy)]
pub struct DirectionInput<'a> {
    pub key: &'a FlowKey,
    pub ingress: &'a IngressContext,
    pub origin: Option<&'a TunnelOrigin>,
}

/// Outcome of resolving both directions of a pair.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Member index of the forward record.
    pub member_index: MemberIndex,
    /// Member index of the reverse record.
    pub reverse_member_index: MemberIndex,
    pub forward: Result<Binding, ResolveError>,
    pub reverse: Result<Binding, ResolveError>,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        self.forward.is_ok() && self.reverse.is_ok()
    }

    /// The first failure, forward direction first.
    pub fn failure(&self) -> Option<&ResolveError> {
        self.forward
            .as_ref()
            .err()
            .or_else(|| self.reverse.as_ref().err())
    }

    /// `None` when both directions resolved.
    pub fn short_flow_reason(&self) -> Option<ShortFlowReason> {
        self.failure().map(ShortFlowReason::from)
    }
}

/// Resolves flow pairs against a route provider and a redirect chain.
#[derive(Clone)]
pub struct Resolver {
    routes: Arc<dyn RouteSnapshotProvider>,
    chain: RedirectChain,
}

impl Resolver {
    pub fn new(routes: Arc<dyn RouteSnapshotProvider>, chain: RedirectChain) -> Self {
        Self { routes, chain }
    }

    pub fn routes(&self) -> &Arc<dyn RouteSnapshotProvider> {
        &self.routes
    }

    pub fn chain(&self) -> &RedirectChain {
        &self.chain
    }

    /// Resolves the conversation a packet classified as `key` belongs to.
    ///
    /// The reverse key is derived through the redirect chain and has no
    /// ingress or origin of its own.
    pub fn resolve(
        &self,
        key: &FlowKey,
        ingress: &IngressContext,
        origin: Option<&TunnelOrigin>,
    ) -> Resolution {
        let reverse_key = self.chain.reverse_key(key);
        let reverse_ingress = IngressContext::default();
        self.resolve_pair(
            DirectionInput {
                key,
                ingress,
                origin,
            },
            DirectionInput {
                key: &reverse_key,
                ingress: &reverse_ingress,
                origin: None,
            },
        )
    }

    /// Resolves both directions of a pair and the member index of each.
    pub fn resolve_pair(&self, forward: DirectionInput<'_>, reverse: DirectionInput<'_>) -> Resolution {
        let forward_binding = self.resolve_direction(forward.key, forward.ingress);
        let reverse_binding = self.resolve_direction(reverse.key, reverse.ingress);

        let member_index = reverse_binding
            .as_ref()
            .map_or(MemberIndex::NONE, |b| match_member(&b.decision, forward.origin));
        let reverse_member_index = forward_binding
            .as_ref()
            .map_or(MemberIndex::NONE, |b| match_member(&b.decision, reverse.origin));

        Resolution {
            member_index,
            reverse_member_index,
            forward: forward_binding,
            reverse: reverse_binding,
        }
    }

    /// Binds one direction to the current decision for its lookup target.
    pub fn resolve_direction(
        &self,
        key: &FlowKey,
        ingress: &IngressContext,
    ) -> Result<Binding, ResolveError> {
        let target = self.chain.lookup_target(key, ingress);
        match self.routes.lookup_decision(target.vrf, &target.address) {
            Some(decision) => Ok(Binding::new(decision, target)),
            None if target.is_substituted() => Err(ResolveError::RedirectChainIncomplete {
                original_vrf: key.vrf,
                vrf: target.vrf,
                address: target.address,
            }),
            None => Err(ResolveError::DestinationUnresolved {
                vrf: target.vrf,
                address: target.address,
            }),
        }
    }

    /// Returns true if `binding` is still what `key` resolves to now.
    ///
    /// Both the lookup target and the decision behind it are re-evaluated.
    pub fn is_current(&self, binding: &Binding, key: &FlowKey, ingress: &IngressContext) -> bool {
        let target = self.chain.lookup_target(key, ingress);
        if target.vrf != binding.target.vrf || target.address != binding.target.address {
            return false;
        }
        binding.matches(
            self.routes
                .lookup_decision(target.vrf, &target.address)
                .as_ref(),
        )
    }
}

/// Finds the position of `origin` in `decision`.
///
/// Members are matched by endpoint address. The label only narrows the
/// candidates when several members share the address, and is ignored if it
/// matches none of them. Remaining ties go to the lowest position.
pub fn match_member(decision: &RouteDecision, origin: Option<&TunnelOrigin>) -> MemberIndex {
    let Some(origin) = origin else {
        return MemberIndex::NONE;
    };
    let candidates: Vec<_> = decision
        .next_hop
        .members()
        .iter()
        .filter(|m| m.endpoint == origin.address)
        .collect();

    let labelled: Vec<_> = match origin.label {
        Some(label) => candidates
            .iter()
            .copied()
            .filter(|m| m.label == label)
            .collect(),
        None => Vec::new(),
    };
    let narrowed = if labelled.is_empty() {
        &candidates
    } else {
        &labelled
    };

    if narrowed.len() > 1 {
        debug!(
            "Resolver: origin {} matches {} members of {}, using lowest index",
            origin,
            narrowed.len(),
            decision.route
        );
    }
    narrowed
        .first()
        .map_or(MemberIndex::NONE, |m| MemberIndex::new(m.index))
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redirect::{FloatingIpTable, VrfAssignAcl, VrfAssignRule};
    use crate::route::{ComponentKey, NextHop, Path, RouteKey, RouteTable};
    use pretty_assertions::assert_eq;
    use vrouter_types::IpProtocol;

    fn addr(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    fn mx(n: u8) -> ComponentKey {
        ComponentKey::new(addr(&format!("100.1.1.{}", n)), 15 + u32::from(n))
    }

    struct Fixture {
        routes: Arc<RouteTable>,
        acl: Arc<VrfAssignAcl>,
        resolver: Resolver,
    }

    fn fixture() -> Fixture {
        let routes = Arc::new(RouteTable::new());
        let acl = Arc::new(VrfAssignAcl::new());
        let chain = RedirectChain::new(acl.clone(), Arc::new(FloatingIpTable::new()));
        let resolver = Resolver::new(routes.clone(), chain);
        routes
            .set_route(
                1,
                "1.1.1.1/32".parse().unwrap(),
                NextHop::Single(Path::interface("vnet1")),
            )
            .unwrap();
        routes
            .set_group(1, "0.0.0.0/0".parse().unwrap(), [mx(1), mx(2), mx(3), mx(4)])
            .unwrap();
        Fixture {
            routes,
            acl,
            resolver,
        }
    }

    fn remote_key() -> FlowKey {
        FlowKey::new(1, addr("8.8.8.8"), addr("1.1.1.1"), IpProtocol::Icmp)
    }

    #[test]
    fn test_member_index_from_origin() {
        let f = fixture();
        for n in 1..=4u8 {
            let origin = TunnelOrigin::new(addr(&format!("100.1.1.{}", n)));
            let res = f
                .resolver
                .resolve(&remote_key(), &IngressContext::default(), Some(&origin));
            assert!(res.is_resolved());
            assert_eq!(res.member_index, MemberIndex::new(usize::from(n) - 1));
            assert!(res.reverse_member_index.is_none());

            let reverse = res.reverse.unwrap();
            assert!(reverse.decision.next_hop.is_group());
            assert_eq!(reverse.decision.next_hop.members().len(), 4);
        }
    }

    #[test]
    fn test_local_packet_has_no_member() {
        let f = fixture();
        let res = f
            .resolver
            .resolve(&remote_key(), &IngressContext::interface("vnet1"), None);
        assert!(res.is_resolved());
        assert!(res.member_index.is_none());
    }

    #[test]
    fn test_origin_outside_group() {
        let f = fixture();
        let origin = TunnelOrigin::new(addr("100.1.1.99"));
        let res = f
            .resolver
            .resolve(&remote_key(), &IngressContext::default(), Some(&origin));
        assert!(res.is_resolved());
        assert!(res.member_index.is_none());
    }

    #[test]
    fn test_duplicate_members_tie_break() {
        let route = RouteKey::new(1, "0.0.0.0/0".parse().unwrap());
        let decision = RouteDecision::new(
            route,
            1,
            NextHop::group([
                ComponentKey::new(addr("100.1.1.1"), 16),
                ComponentKey::new(addr("100.1.1.2"), 20),
                ComponentKey::new(addr("100.1.1.2"), 21),
                ComponentKey::new(addr("100.1.1.2"), 20),
            ]),
        );
        let origin = TunnelOrigin::new(addr("100.1.1.2"));

        assert_eq!(match_member(&decision, Some(&origin)), MemberIndex::new(1));
        assert_eq!(
            match_member(&decision, Some(&origin.with_label(21))),
            MemberIndex::new(2)
        );
        assert_eq!(
            match_member(&decision, Some(&origin.with_label(20))),
            MemberIndex::new(1)
        );
        // An unknown label leaves the address match in charge.
        assert_eq!(
            match_member(&decision, Some(&origin.with_label(99))),
            MemberIndex::new(1)
        );
        assert!(match_member(&decision, None).is_none());
    }

    #[test]
    fn test_single_path_has_no_member() {
        let route = RouteKey::new(1, "0.0.0.0/0".parse().unwrap());
        let decision = RouteDecision::new(
            route,
            1,
            NextHop::Single(Path::tunnel(addr("100.1.1.1"), 16)),
        );
        let origin = TunnelOrigin::new(addr("100.1.1.1"));
        assert!(match_member(&decision, Some(&origin)).is_none());
    }

    #[test]
    fn test_redirect_without_route_never_falls_back() {
        let f = fixture();
        f.acl
            .add_rule(VrfAssignRule::new(1, 1, 9).src("1.1.1.0/24".parse().unwrap()));

        let origin = TunnelOrigin::new(addr("100.1.1.1"));
        let res = f
            .resolver
            .resolve(&remote_key(), &IngressContext::default(), Some(&origin));

        assert!(res.forward.is_ok());
        assert_eq!(
            res.reverse.as_ref().unwrap_err(),
            &ResolveError::RedirectChainIncomplete {
                original_vrf: 1,
                vrf: 9,
                address: addr("8.8.8.8"),
            }
        );
        assert!(res.member_index.is_none());
        assert_eq!(
            res.short_flow_reason(),
            Some(ShortFlowReason::RedirectChainIncomplete)
        );
    }

    #[test]
    fn test_destination_unresolved() {
        let f = fixture();
        let key = FlowKey::new(5, addr("8.8.8.8"), addr("1.1.1.1"), IpProtocol::Icmp);
        let res = f.resolver.resolve(&key, &IngressContext::default(), None);
        assert_eq!(
            res.short_flow_reason(),
            Some(ShortFlowReason::DestinationUnresolved)
        );
    }

    #[test]
    fn test_is_current_tracks_route_and_redirect() {
        let f = fixture();
        let reverse = remote_key().reverse();
        let ingress = IngressContext::default();
        let binding = f.resolver.resolve_direction(&reverse, &ingress).unwrap();
        assert!(f.resolver.is_current(&binding, &reverse, &ingress));

        f.routes
            .add_group_member(1, "0.0.0.0/0".parse().unwrap(), mx(5))
            .unwrap();
        assert!(!f.resolver.is_current(&binding, &reverse, &ingress));

        let binding = f.resolver.resolve_direction(&reverse, &ingress).unwrap();
        f.routes
            .set_group(2, "0.0.0.0/0".parse().unwrap(), [mx(1)])
            .unwrap();
        f.acl
            .add_rule(VrfAssignRule::new(1, 1, 2).src("1.1.1.0/24".parse().unwrap()));
        assert!(!f.resolver.is_current(&binding, &reverse, &ingress));
    }
}
