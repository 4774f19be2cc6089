//! Per-partition flow table.
//!
//! Owns the forward and reverse records of every pair in one partition.
//! Both records of a pair are created, refreshed and destroyed together.
//! Route changes only mark bindings; they are re-resolved the next time the
//! pair is used, except for withdrawals, which are revalidated at once.

use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use vrouter_common::{Arena, Handle, SyncMap};
use vrouter_types::VrfId;

use super::event::FlowEvent;
use super::key::{FlowKey, IngressContext, Packet, TunnelOrigin};
use super::record::{Binding, Direction, FlowRecord, FlowView};
use super::resolver::{DirectionInput, ResolveError, Resolver};
use super::short_flow::{EvictReason, FlowState};
use crate::route::{RouteChange, RouteChangeKind};

/// Error type for flow table operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("Flow table {partition} is full ({limit} records)")]
    TableFull { partition: usize, limit: usize },

    #[error("Flow not found: {0}")]
    FlowNotFound(FlowKey),

    #[error("Flow key {0} is its own reverse")]
    SelfReverse(FlowKey),

    #[error("Flow key {0} is already indexed")]
    KeyConflict(FlowKey),

    #[error("Packet queue for partition {0} is closed")]
    QueueClosed(usize),

    #[error("Packet queue for partition {0} is full")]
    QueueFull(usize),
}

/// Result type for flow table operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Limits and policy for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTableConfig {
    /// Maximum number of records (two per pair).
    pub max_flows: usize,
    /// Evict pairs that no longer resolve after a route withdrawal instead
    /// of keeping them as short flows.
    pub evict_on_withdraw: bool,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            max_flows: 65536,
            evict_on_withdraw: true,
        }
    }
}

/// Key index change the owner of several partitions must mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexChange {
    Added(FlowKey),
    Removed(FlowKey),
}

/// Flow records of one partition.
pub struct FlowTable {
    partition: usize,
    config: FlowTableConfig,
    records: Arena<FlowRecord>,
    index: SyncMap<FlowKey, Handle>,
    events: Option<broadcast::Sender<FlowEvent>>,
    index_changes: Vec<IndexChange>,
}

impl FlowTable {
    pub fn new(partition: usize, config: FlowTableConfig) -> Self {
        Self {
            partition,
            config,
            records: Arena::new(),
            index: SyncMap::new(),
            events: None,
            index_changes: Vec::new(),
        }
    }

    /// Publishes pair lifecycle events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<FlowEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Number of records (two per pair).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pair_count(&self) -> usize {
        self.records.len() / 2
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the record for `key` as stored, without refreshing it.
    pub fn record(&self, key: &FlowKey) -> Option<&FlowRecord> {
        self.index.get(key).and_then(|h| self.records.get(*h))
    }

    /// Returns the record paired with `key`'s record.
    pub fn partner(&self, key: &FlowKey) -> Option<&FlowRecord> {
        self.record(key).and_then(|r| self.records.get(r.paired))
    }

    pub fn keys(&self) -> impl Iterator<Item = &FlowKey> {
        self.index.keys()
    }

    /// Takes the key additions and removals made since the last call.
    pub fn drain_index_changes(&mut self) -> Vec<IndexChange> {
        std::mem::take(&mut self.index_changes)
    }

    /// Handles one classified packet and returns the view of its record.
    ///
    /// The pair is resolved when it is created, when the packet carries
    /// tunnel-origin metadata, when the packet's ingress differs from the
    /// recorded one, when the pair is a short flow, and when any binding of
    /// the pair is stale.
    pub fn process_packet(
        &mut self,
        packet: &Packet,
        resolver: &Resolver,
        now: Instant,
    ) -> Result<FlowView> {
        let (handle, created) = self.get_or_create_pair(packet, resolver, now)?;
        if !created {
            let partition = self.partition;
            let record = self
                .records
                .get_mut(handle)
                .ok_or(FlowError::FlowNotFound(packet.key))?;
            record.last_seen = now;

            let mut resolve = record.state.is_short();
            match &packet.tunnel_origin {
                Some(origin) => {
                    record.tunnel_origin = Some(*origin);
                    record.ingress = packet.ingress.clone();
                    resolve = true;
                }
                None if record.ingress != packet.ingress => {
                    if record.ingress.is_known() {
                        info!(
                            "FlowTable[{}]: flow [{}] moved from {} to {}",
                            partition, record.key, record.ingress, packet.ingress
                        );
                    }
                    record.tunnel_origin = None;
                    record.ingress = packet.ingress.clone();
                    resolve = true;
                }
                None => {}
            }

            if resolve || self.is_stale(handle, resolver) {
                self.refresh_pair(handle, resolver);
            }
        }
        self.view_of(handle)
            .ok_or(FlowError::FlowNotFound(packet.key))
    }

    /// Returns the pair handling `packet.key`, creating and resolving it if
    /// the key is unknown. The boolean is true if the pair was created.
    ///
    /// A packet for an existing key never creates anything and leaves the
    /// pair's bindings untouched.
    pub fn get_or_create_pair(
        &mut self,
        packet: &Packet,
        resolver: &Resolver,
        now: Instant,
    ) -> Result<(Handle, bool)> {
        if let Some(handle) = self.index.get(&packet.key) {
            return Ok((*handle, false));
        }

        let forward_key = packet.key;
        let reverse_key = resolver.chain().reverse_key(&forward_key);
        if reverse_key == forward_key {
            return Err(FlowError::SelfReverse(forward_key));
        }
        if let Some(&owner) = self.index.get(&reverse_key) {
            debug!(
                "FlowTable[{}]: [{}] claimed by new flow [{}]",
                self.partition, reverse_key, forward_key
            );
            self.remove_pair(owner, EvictReason::Replaced);
        }
        if self.records.len() + 2 > self.config.max_flows {
            warn!(
                "FlowTable[{}]: table full, dropping new flow [{}]",
                self.partition, forward_key
            );
            return Err(FlowError::TableFull {
                partition: self.partition,
                limit: self.config.max_flows,
            });
        }

        let forward = self.records.insert_with(|own| {
            FlowRecord::new(
                forward_key,
                Direction::Forward,
                own,
                packet.ingress.clone(),
                packet.tunnel_origin,
                now,
            )
        });
        let reverse = self.records.insert(FlowRecord::new(
            reverse_key,
            Direction::Reverse,
            forward,
            IngressContext::default(),
            None,
            now,
        ));
        if let Some(record) = self.records.get_mut(forward) {
            record.paired = reverse;
        }
        for (key, handle) in [(forward_key, forward), (reverse_key, reverse)] {
            if self.index.try_insert(key, handle).is_err() {
                warn!(
                    "FlowTable[{}]: [{}] already indexed, dropping new flow [{}]",
                    self.partition, key, forward_key
                );
                if self.index.get(&forward_key) == Some(&forward) {
                    self.index.remove(&forward_key);
                }
                self.records.remove(forward);
                self.records.remove(reverse);
                return Err(FlowError::KeyConflict(key));
            }
        }
        self.index_changes.push(IndexChange::Added(forward_key));
        self.index_changes.push(IndexChange::Added(reverse_key));

        let state = self
            .resolve_pair(forward, resolver)
            .map_or(FlowState::Active, |(_, new)| new);
        debug!(
            "FlowTable[{}]: created [{}] <-> [{}] {}",
            self.partition, forward_key, reverse_key, state
        );
        self.emit(FlowEvent::PairCreated {
            forward: forward_key,
            reverse: reverse_key,
            state,
        });
        Ok((forward, true))
    }

    /// Returns the view of `key`'s record, refreshing the pair first if any
    /// of its bindings is stale.
    pub fn view(&mut self, key: &FlowKey, resolver: &Resolver) -> Option<FlowView> {
        let handle = *self.index.get(key)?;
        if self.is_stale(handle, resolver) {
            self.refresh_pair(handle, resolver);
        }
        self.view_of(handle)
    }

    /// Checks that traffic for `key` from `origin` arrives over a valid
    /// return path: the origin must be the endpoint or a group member of the
    /// decision bound by the partner record. The pair is refreshed first.
    pub fn rpf_check(
        &mut self,
        key: &FlowKey,
        origin: &TunnelOrigin,
        resolver: &Resolver,
    ) -> Result<bool> {
        let handle = *self
            .index
            .get(key)
            .ok_or(FlowError::FlowNotFound(*key))?;
        if self.is_stale(handle, resolver) {
            self.refresh_pair(handle, resolver);
        }
        let partner = self
            .records
            .get(handle)
            .and_then(|r| self.records.get(r.paired))
            .ok_or(FlowError::FlowNotFound(*key))?;
        Ok(partner
            .binding
            .as_ref()
            .map_or(false, |b| b.decision.next_hop.has_endpoint(&origin.address)))
    }

    /// Removes the pair `key` belongs to. Returns the final view of `key`'s
    /// record.
    pub fn invalidate_pair(&mut self, key: &FlowKey) -> Option<FlowView> {
        let handle = *self.index.get(key)?;
        let (forward, reverse) = self.remove_pair(handle, EvictReason::Invalidated)?;
        Some(if forward.key == *key {
            FlowView::from(&forward)
        } else {
            FlowView::from(&reverse)
        })
    }

    /// Removes every pair with a record in table `vrf`.
    pub fn invalidate_table(&mut self, vrf: VrfId) -> usize {
        let doomed: BTreeSet<Handle> = self
            .records
            .iter()
            .filter(|(_, r)| r.key.vrf == vrf)
            .filter_map(|(h, _)| self.pair_handles(h).map(|(f, _)| f))
            .collect();
        for handle in &doomed {
            self.remove_pair(*handle, EvictReason::TableRemoved);
        }
        if !doomed.is_empty() {
            info!(
                "FlowTable[{}]: removed {} flows of vrf {}",
                self.partition,
                doomed.len(),
                vrf
            );
        }
        doomed.len()
    }

    /// Removes pairs with no traffic in either direction for `idle_timeout`.
    pub fn sweep(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let expired: Vec<Handle> = self
            .records
            .iter()
            .filter(|(_, r)| r.direction == Direction::Forward)
            .filter_map(|(h, r)| {
                let partner_seen = self
                    .records
                    .get(r.paired)
                    .map_or(r.last_seen, |p| p.last_seen);
                let last_seen = r.last_seen.max(partner_seen);
                (now.saturating_duration_since(last_seen) >= idle_timeout).then_some(h)
            })
            .collect();
        for handle in &expired {
            self.remove_pair(*handle, EvictReason::IdleTimeout);
        }
        if !expired.is_empty() {
            debug!(
                "FlowTable[{}]: aged out {} flows",
                self.partition,
                expired.len()
            );
        }
        expired.len()
    }

    /// Marks bindings affected by `change` for refresh.
    ///
    /// Pairs affected by a withdrawal are re-resolved immediately; those that
    /// no longer resolve are evicted or become short flows depending on
    /// configuration. Returns the number of evicted pairs.
    pub fn on_route_change(&mut self, change: &RouteChange, resolver: &Resolver) -> usize {
        // Unresolved directions hold no binding and are not matched here. A
        // short flow is healed by its next packet, not by notifications.
        let affected: Vec<Handle> = self
            .records
            .iter()
            .filter(|(_, r)| {
                r.binding
                    .as_ref()
                    .map_or(false, |b| change.affects(b.target.vrf, &b.target.address))
            })
            .map(|(h, _)| h)
            .collect();
        for handle in &affected {
            if let Some(record) = self.records.get_mut(*handle) {
                record.needs_refresh = true;
            }
        }
        if change.kind != RouteChangeKind::Withdrawn || affected.is_empty() {
            return 0;
        }

        let pairs: BTreeSet<Handle> = affected
            .iter()
            .filter_map(|h| self.pair_handles(*h).map(|(f, _)| f))
            .collect();
        let mut evicted = 0;
        for handle in pairs {
            self.refresh_pair(handle, resolver);
            let short = self
                .records
                .get(handle)
                .map_or(false, |r| r.state.is_short());
            if short && self.config.evict_on_withdraw {
                self.remove_pair(handle, EvictReason::RouteWithdrawn);
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(
                "FlowTable[{}]: {} withdrawn, evicted {} flows",
                self.partition, change.route, evicted
            );
        }
        evicted
    }

    /// Marks every binding for refresh.
    pub fn mark_all_stale(&mut self) {
        let handles: Vec<Handle> = self.records.iter().map(|(h, _)| h).collect();
        for handle in handles {
            if let Some(record) = self.records.get_mut(handle) {
                record.needs_refresh = true;
            }
        }
    }

    fn emit(&self, event: FlowEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }

    /// (forward, reverse) handles of the pair `handle` belongs to.
    fn pair_handles(&self, handle: Handle) -> Option<(Handle, Handle)> {
        let record = self.records.get(handle)?;
        match record.direction {
            Direction::Forward => Some((handle, record.paired)),
            Direction::Reverse => Some((record.paired, handle)),
        }
    }

    fn view_of(&self, handle: Handle) -> Option<FlowView> {
        self.records.get(handle).map(FlowView::from)
    }

    /// True if either record is marked or holds a binding that no longer
    /// matches current route and redirect state.
    fn is_stale(&self, handle: Handle, resolver: &Resolver) -> bool {
        let Some((forward, reverse)) = self.pair_handles(handle) else {
            return false;
        };
        [forward, reverse].iter().any(|h| match self.records.get(*h) {
            Some(record) => {
                record.needs_refresh
                    || record
                        .binding
                        .as_ref()
                        .map_or(false, |b| !resolver.is_current(b, &record.key, &record.ingress))
            }
            None => false,
        })
    }

    fn refresh_pair(&mut self, handle: Handle, resolver: &Resolver) {
        let Some((from, to)) = self.resolve_pair(handle, resolver) else {
            return;
        };
        if from == to {
            return;
        }
        let Some((forward, reverse)) = self.pair_handles(handle) else {
            return;
        };
        let (Some(f), Some(r)) = (self.records.get(forward), self.records.get(reverse)) else {
            return;
        };
        match f.failure.as_ref().or(r.failure.as_ref()) {
            Some(err) => info!(
                "FlowTable[{}]: [{}] {} -> {}: {}",
                self.partition, f.key, from, to, err
            ),
            None => info!(
                "FlowTable[{}]: [{}] {} -> {}",
                self.partition, f.key, from, to
            ),
        }
        let event = FlowEvent::StateChanged {
            forward: f.key,
            reverse: r.key,
            from,
            to,
        };
        self.emit(event);
    }

    /// Re-resolves both records of a pair. Returns the pair state before and
    /// after.
    fn resolve_pair(&mut self, handle: Handle, resolver: &Resolver) -> Option<(FlowState, FlowState)> {
        let (forward, reverse) = self.pair_handles(handle)?;
        let resolution = {
            let f = self.records.get(forward)?;
            let r = self.records.get(reverse)?;
            resolver.resolve_pair(
                DirectionInput {
                    key: &f.key,
                    ingress: &f.ingress,
                    origin: f.tunnel_origin.as_ref(),
                },
                DirectionInput {
                    key: &r.key,
                    ingress: &r.ingress,
                    origin: r.tunnel_origin.as_ref(),
                },
            )
        };

        let reason = resolution.short_flow_reason();
        let (f, r) = self.records.get2_mut(forward, reverse)?;
        let from = f.state;
        let to = from.on_resolution(reason);

        apply_binding(f, resolution.forward);
        apply_binding(r, resolution.reverse);
        f.member_index = resolution.member_index;
        r.member_index = resolution.reverse_member_index;
        for record in [f, r] {
            record.state = to;
            record.needs_refresh = false;
        }
        Some((from, to))
    }

    /// Removes both records of a pair and returns them with their final
    /// state, forward first.
    fn remove_pair(&mut self, handle: Handle, reason: EvictReason) -> Option<(FlowRecord, FlowRecord)> {
        let (forward, reverse) = self.pair_handles(handle)?;
        let mut f = self.records.remove(forward)?;
        let mut r = self.records.remove(reverse)?;
        for record in [&mut f, &mut r] {
            record.state = record.state.evict(reason);
            self.index.remove(&record.key);
            self.index_changes.push(IndexChange::Removed(record.key));
        }
        debug!(
            "FlowTable[{}]: deleted [{}] <-> [{}] ({})",
            self.partition, f.key, r.key, reason
        );
        self.emit(FlowEvent::PairDeleted {
            forward: f.key,
            reverse: r.key,
            reason,
        });
        Some((f, r))
    }
}

fn apply_binding(record: &mut FlowRecord, outcome: std::result::Result<Binding, ResolveError>) {
    match outcome {
        Ok(binding) => {
            record.binding = Some(binding);
            record.failure = None;
        }
        Err(err) => {
            record.binding = None;
            record.failure = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::record::MemberIndex;
    use crate::flow::short_flow::ShortFlowReason;
    use crate::redirect::{FloatingIpTable, RedirectChain, VrfAssignAcl, VrfAssignRule};
    use crate::route::{ComponentKey, NextHop, Path, RouteSnapshotProvider, RouteTable};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use vrouter_types::{IpAddress, IpPrefix, IpProtocol};

    fn addr(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    fn mx(n: u8) -> ComponentKey {
        ComponentKey::new(addr(&format!("100.1.1.{}", n)), 15 + u32::from(n))
    }

    fn origin(n: u8) -> TunnelOrigin {
        TunnelOrigin::new(addr(&format!("100.1.1.{}", n)))
    }

    struct Fixture {
        routes: Arc<RouteTable>,
        acl: Arc<VrfAssignAcl>,
        resolver: Resolver,
        table: FlowTable,
    }

    fn fixture_with(config: FlowTableConfig) -> Fixture {
        let routes = Arc::new(RouteTable::new());
        let acl = Arc::new(VrfAssignAcl::new());
        let chain = RedirectChain::new(acl.clone(), Arc::new(FloatingIpTable::new()));
        let resolver = Resolver::new(routes.clone(), chain);
        routes
            .set_route(1, prefix("1.1.1.1/32"), NextHop::Single(Path::interface("vnet1")))
            .unwrap();
        routes
            .set_group(1, prefix("0.0.0.0/0"), [mx(1), mx(2), mx(3), mx(4)])
            .unwrap();
        Fixture {
            routes,
            acl,
            resolver,
            table: FlowTable::new(0, config),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FlowTableConfig::default())
    }

    fn remote_key() -> FlowKey {
        FlowKey::new(1, addr("8.8.8.8"), addr("1.1.1.1"), IpProtocol::Icmp)
    }

    fn tunnel_packet(n: u8) -> Packet {
        Packet::tunnel(remote_key(), origin(n), IngressContext::interface("vhost0"))
    }

    #[test]
    fn test_create_pair() {
        let mut f = fixture();
        let now = Instant::now();
        let view = f
            .table
            .process_packet(&tunnel_packet(2), &f.resolver, now)
            .unwrap();

        assert_eq!(f.table.len(), 2);
        assert_eq!(f.table.pair_count(), 1);
        assert_eq!(view.member_index, MemberIndex::new(1));
        assert!(!view.short_flow);

        let reverse = f.table.record(&remote_key().reverse()).unwrap();
        assert_eq!(reverse.direction(), Direction::Reverse);
        assert!(reverse.member_index().is_none());
        let decision = reverse.binding().unwrap().decision.clone();
        assert!(decision.next_hop.is_group());

        let partner = f.table.partner(&remote_key()).unwrap();
        assert_eq!(partner.key(), &remote_key().reverse());

        let changes = f.table.drain_index_changes();
        assert_eq!(
            changes,
            vec![
                IndexChange::Added(remote_key()),
                IndexChange::Added(remote_key().reverse())
            ]
        );
        assert!(f.table.drain_index_changes().is_empty());
    }

    #[test]
    fn test_existing_key_never_creates() {
        let mut f = fixture();
        let now = Instant::now();
        let packet = tunnel_packet(1);
        let (first, created) = f.table.get_or_create_pair(&packet, &f.resolver, now).unwrap();
        assert!(created);
        let (again, created) = f.table.get_or_create_pair(&packet, &f.resolver, now).unwrap();
        assert!(!created);
        assert_eq!(first, again);

        let reverse = Packet::local(remote_key().reverse(), IngressContext::interface("vnet1"));
        let (_, created) = f.table.get_or_create_pair(&reverse, &f.resolver, now).unwrap();
        assert!(!created);
        assert_eq!(f.table.len(), 2);
    }

    #[test]
    fn test_retag_updates_same_record() {
        let mut f = fixture();
        let now = Instant::now();
        for n in 1..=4u8 {
            let view = f
                .table
                .process_packet(&tunnel_packet(n), &f.resolver, now)
                .unwrap();
            assert_eq!(view.member_index, MemberIndex::new(usize::from(n) - 1));
            assert_eq!(f.table.len(), 2);
        }
    }

    #[test]
    fn test_table_full() {
        let mut f = fixture_with(FlowTableConfig {
            max_flows: 2,
            evict_on_withdraw: true,
        });
        let now = Instant::now();
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, now)
            .unwrap();

        let other = Packet::local(
            FlowKey::new(1, addr("1.1.1.1"), addr("9.9.9.9"), IpProtocol::Icmp),
            IngressContext::interface("vnet1"),
        );
        assert_eq!(
            f.table.process_packet(&other, &f.resolver, now).unwrap_err(),
            FlowError::TableFull {
                partition: 0,
                limit: 2
            }
        );
        assert_eq!(f.table.len(), 2);
        assert!(!f.table.contains(&other.key));
    }

    #[test]
    fn test_self_reverse_rejected() {
        let mut f = fixture();
        let key = FlowKey::new(1, addr("1.1.1.1"), addr("1.1.1.1"), IpProtocol::Icmp);
        let packet = Packet::local(key, IngressContext::interface("vnet1"));
        assert_eq!(
            f.table
                .process_packet(&packet, &f.resolver, Instant::now())
                .unwrap_err(),
            FlowError::SelfReverse(key)
        );
        assert!(f.table.is_empty());
    }

    #[test]
    fn test_invalidate_pair_removes_both() {
        let mut f = fixture();
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, Instant::now())
            .unwrap();
        f.table.drain_index_changes();

        let view = f.table.invalidate_pair(&remote_key().reverse()).unwrap();
        assert_eq!(view.key, remote_key().reverse());
        assert_eq!(view.state, FlowState::Evicted(EvictReason::Invalidated));
        assert!(f.table.is_empty());
        assert_eq!(f.table.drain_index_changes().len(), 2);
        assert!(f.table.invalidate_pair(&remote_key()).is_none());
    }

    #[test]
    fn test_sweep_idle_pairs() {
        let mut f = fixture();
        let start = Instant::now();
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, start)
            .unwrap();

        let busy = Packet::local(
            FlowKey::new(1, addr("1.1.1.1"), addr("9.9.9.9"), IpProtocol::Icmp),
            IngressContext::interface("vnet1"),
        );
        f.table.process_packet(&busy, &f.resolver, start).unwrap();
        // Traffic on the reverse direction keeps the pair alive.
        let reply = Packet::tunnel(busy.key.reverse(), origin(3), IngressContext::interface("vhost0"));
        f.table
            .process_packet(&reply, &f.resolver, start + Duration::from_secs(100))
            .unwrap();

        let removed = f
            .table
            .sweep(start + Duration::from_secs(180), Duration::from_secs(180));
        assert_eq!(removed, 1);
        assert!(!f.table.contains(&remote_key()));
        assert!(!f.table.contains(&remote_key().reverse()));
        assert!(f.table.contains(&busy.key));
        assert_eq!(f.table.len(), 2);
    }

    #[test]
    fn test_lazy_refresh_on_view() {
        let mut f = fixture();
        f.table
            .process_packet(&tunnel_packet(3), &f.resolver, Instant::now())
            .unwrap();
        let mut stream = f.routes.subscribe();

        // Reversed group moves 100.1.1.3 from index 2 to index 1.
        f.routes
            .set_group(1, prefix("0.0.0.0/0"), [mx(4), mx(3), mx(2), mx(1)])
            .unwrap();
        let current = f.routes.get(&crate::route::RouteKey::new(1, prefix("0.0.0.0/0"))).unwrap();

        while let Some(crate::route::RouteNotification::Changed(change)) = stream.try_recv() {
            assert_eq!(f.table.on_route_change(&change, &f.resolver), 0);
        }
        assert!(f.table.record(&remote_key().reverse()).unwrap().needs_refresh);

        let view = f.table.view(&remote_key().reverse(), &f.resolver).unwrap();
        assert_eq!(view.generation(), Some(current.generation));
        let forward = f.table.view(&remote_key(), &f.resolver).unwrap();
        assert_eq!(forward.member_index, MemberIndex::new(1));
    }

    #[test]
    fn test_view_refreshes_without_notification() {
        let mut f = fixture();
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, Instant::now())
            .unwrap();
        f.routes
            .add_group_member(1, prefix("0.0.0.0/0"), mx(5))
            .unwrap();

        let view = f.table.view(&remote_key().reverse(), &f.resolver).unwrap();
        assert_eq!(view.decision.unwrap().next_hop.members().len(), 5);
    }

    #[test]
    fn test_withdraw_evicts() {
        let mut f = fixture();
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, Instant::now())
            .unwrap();
        let mut stream = f.routes.subscribe();
        f.routes.remove_route(1, prefix("0.0.0.0/0")).unwrap();

        let mut evicted = 0;
        while let Some(crate::route::RouteNotification::Changed(change)) = stream.try_recv() {
            evicted += f.table.on_route_change(&change, &f.resolver);
        }
        assert_eq!(evicted, 1);
        assert!(f.table.is_empty());
    }

    #[test]
    fn test_withdraw_without_eviction_marks_short() {
        let mut f = fixture_with(FlowTableConfig {
            max_flows: 16,
            evict_on_withdraw: false,
        });
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, Instant::now())
            .unwrap();
        let mut stream = f.routes.subscribe();
        f.routes.remove_route(1, prefix("0.0.0.0/0")).unwrap();
        while let Some(crate::route::RouteNotification::Changed(change)) = stream.try_recv() {
            f.table.on_route_change(&change, &f.resolver);
        }

        let record = f.table.record(&remote_key()).unwrap();
        assert_eq!(
            record.state(),
            FlowState::ShortFlow(ShortFlowReason::DestinationUnresolved)
        );
        assert!(record.member_index().is_none());
        assert!(f.table.partner(&remote_key()).unwrap().binding().is_none());
    }

    #[test]
    fn test_short_flow_heals_on_later_packet() {
        let mut f = fixture();
        f.acl
            .add_rule(VrfAssignRule::new(1, 1, 2).src(prefix("1.1.1.0/24")));
        let now = Instant::now();

        let view = f
            .table
            .process_packet(&tunnel_packet(1), &f.resolver, now)
            .unwrap();
        assert!(view.short_flow);
        assert!(f.table.record(&remote_key().reverse()).unwrap().is_short_flow());

        f.routes.set_group(2, prefix("0.0.0.0/0"), [mx(4), mx(3)]).unwrap();
        let view = f
            .table
            .process_packet(&tunnel_packet(3), &f.resolver, now)
            .unwrap();
        assert!(!view.short_flow);
        assert_eq!(view.state, FlowState::Active);
        assert_eq!(view.member_index, MemberIndex::new(1));
    }

    #[test]
    fn test_route_notification_leaves_short_flow_to_packets() {
        let mut f = fixture();
        f.acl
            .add_rule(VrfAssignRule::new(1, 1, 2).src(prefix("1.1.1.0/24")));
        let now = Instant::now();
        f.table
            .process_packet(&tunnel_packet(2), &f.resolver, now)
            .unwrap();
        let mut stream = f.routes.subscribe();

        f.routes.set_group(2, prefix("0.0.0.0/0"), [mx(1), mx(2)]).unwrap();
        while let Some(crate::route::RouteNotification::Changed(change)) = stream.try_recv() {
            assert_eq!(f.table.on_route_change(&change, &f.resolver), 0);
        }
        let reverse = f.table.record(&remote_key().reverse()).unwrap();
        assert!(reverse.binding().is_none());
        assert!(!reverse.needs_refresh);
        assert!(f.table.view(&remote_key(), &f.resolver).unwrap().short_flow);

        let view = f
            .table
            .process_packet(&tunnel_packet(2), &f.resolver, now)
            .unwrap();
        assert!(!view.short_flow);
        assert_eq!(view.member_index, MemberIndex::new(1));
    }

    #[test]
    fn test_flow_move_clears_member_index() {
        let mut f = fixture();
        let now = Instant::now();
        let view = f
            .table
            .process_packet(&tunnel_packet(2), &f.resolver, now)
            .unwrap();
        assert_eq!(view.member_index, MemberIndex::new(1));

        let moved = Packet::local(remote_key(), IngressContext::interface("vnet2"));
        let view = f.table.process_packet(&moved, &f.resolver, now).unwrap();
        assert!(view.member_index.is_none());
        assert!(!view.short_flow);
        let record = f.table.record(&remote_key()).unwrap();
        assert!(record.tunnel_origin().is_none());
        assert_eq!(record.ingress(), &IngressContext::interface("vnet2"));
    }

    #[test]
    fn test_rpf_check() {
        let mut f = fixture();
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, Instant::now())
            .unwrap();

        assert_eq!(f.table.rpf_check(&remote_key(), &origin(4), &f.resolver), Ok(true));
        assert_eq!(f.table.rpf_check(&remote_key(), &origin(9), &f.resolver), Ok(false));

        f.routes
            .remove_group_member(1, prefix("0.0.0.0/0"), addr("100.1.1.4"), 19)
            .unwrap();
        assert_eq!(f.table.rpf_check(&remote_key(), &origin(4), &f.resolver), Ok(false));

        let unknown = remote_key().with_ports(1, 2);
        assert_eq!(
            f.table.rpf_check(&unknown, &origin(1), &f.resolver),
            Err(FlowError::FlowNotFound(unknown))
        );
    }

    #[test]
    fn test_invalidate_table() {
        let mut f = fixture();
        let now = Instant::now();
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, now)
            .unwrap();
        let other = Packet::local(
            FlowKey::new(2, addr("1.1.1.1"), addr("9.9.9.9"), IpProtocol::Icmp),
            IngressContext::interface("vnet9"),
        );
        f.table.process_packet(&other, &f.resolver, now).unwrap();

        assert_eq!(f.table.invalidate_table(1), 1);
        assert_eq!(f.table.len(), 2);
        assert!(f.table.contains(&other.key));
    }

    #[test]
    fn test_events() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut f = fixture();
        f.table = FlowTable::new(0, FlowTableConfig::default()).with_events(tx);
        f.acl
            .add_rule(VrfAssignRule::new(1, 1, 2).src(prefix("1.1.1.0/24")));
        let now = Instant::now();

        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, now)
            .unwrap();
        f.acl.remove_rule(1);
        f.table
            .process_packet(&tunnel_packet(1), &f.resolver, now)
            .unwrap();
        f.table.invalidate_pair(&remote_key());

        let short = FlowState::ShortFlow(ShortFlowReason::RedirectChainIncomplete);
        assert_eq!(
            rx.try_recv().unwrap(),
            FlowEvent::PairCreated {
                forward: remote_key(),
                reverse: remote_key().reverse(),
                state: short,
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            FlowEvent::StateChanged {
                forward: remote_key(),
                reverse: remote_key().reverse(),
                from: short,
                to: FlowState::Active,
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            FlowEvent::PairDeleted {
                forward: remote_key(),
                reverse: remote_key().reverse(),
                reason: EvictReason::Invalidated,
            }
        );
    }
}
