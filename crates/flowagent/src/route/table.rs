//! In-memory route table publishing immutable snapshots.
//!
//! Readers load the current [`RouteSnapshot`] without locking. Writers
//! serialise on a control mutex, clone the affected VRF, apply the change and
//! swap the new snapshot in. Every mutation draws a fresh generation from a
//! single counter and is announced on a broadcast channel.

use arc_swap::ArcSwap;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use vrouter_types::{IpAddress, IpPrefix, VrfId};

use super::decision::{RouteDecision, RouteKey};
use super::nexthop::{ComponentKey, NextHop};

/// Default depth of the route change channel.
pub const DEFAULT_CHANGE_CHANNEL_CAPACITY: usize = 4096;

/// Error type for route table mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Route not found: {0}")]
    RouteNotFound(RouteKey),

    #[error("ECMP group for {0} has no members")]
    EmptyGroup(RouteKey),

    #[error("Route {0} is not an ECMP group")]
    NotAGroup(RouteKey),

    #[error("Member {endpoint}+{label} not found in {route}")]
    MemberNotFound {
        route: RouteKey,
        endpoint: IpAddress,
        label: u32,
    },
}

/// Result type for route table operations.
pub type Result<T> = std::result::Result<T, RouteError>;

/// Source of route decisions consumed by the flow resolver.
pub trait RouteSnapshotProvider: Send + Sync {
    /// Longest-prefix match of `address` in table `vrf`.
    fn lookup_decision(&self, vrf: VrfId, address: &IpAddress) -> Option<Arc<RouteDecision>>;

    /// Subscribes to generation changes of all routes.
    fn subscribe(&self) -> RouteChangeStream;
}

/// What happened to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeKind {
    /// A new decision was published for the route.
    Updated,
    /// The route no longer exists.
    Withdrawn,
}

/// Generation change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChange {
    pub route: RouteKey,
    pub generation: u64,
    pub kind: RouteChangeKind,
}

impl RouteChange {
    /// Returns true if a lookup of `address` in `vrf` may be affected.
    pub fn affects(&self, vrf: VrfId, address: &IpAddress) -> bool {
        self.route.vrf == vrf && self.route.prefix.contains(address)
    }
}

/// Item delivered by a [`RouteChangeStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteNotification {
    Changed(RouteChange),
    /// The subscriber fell behind and `n` changes were dropped. Everything
    /// derived from route state must be treated as stale.
    Lagged(u64),
}

#[derive(Debug, Clone, Copy)]
struct RouteFilter {
    vrf: VrfId,
    prefix: Option<IpPrefix>,
}

impl RouteFilter {
    fn accepts(&self, change: &RouteChange) -> bool {
        if change.route.vrf != self.vrf {
            return false;
        }
        match &self.prefix {
            None => true,
            Some(prefix) => {
                prefix.contains(change.route.prefix.address())
                    || change.route.prefix.contains(prefix.address())
            }
        }
    }
}

/// Subscription to route generation changes.
pub struct RouteChangeStream {
    rx: broadcast::Receiver<RouteChange>,
    filter: Option<RouteFilter>,
}

impl RouteChangeStream {
    pub fn new(rx: broadcast::Receiver<RouteChange>) -> Self {
        Self { rx, filter: None }
    }

    /// Restricts the stream to changes in `vrf` overlapping `prefix`
    /// (all prefixes of the table when `None`).
    pub fn filtered(mut self, vrf: VrfId, prefix: Option<IpPrefix>) -> Self {
        self.filter = Some(RouteFilter { vrf, prefix });
        self
    }

    fn accepts(&self, change: &RouteChange) -> bool {
        self.filter.map_or(true, |f| f.accepts(change))
    }

    /// Waits for the next notification. Returns `None` once the table is gone.
    pub async fn recv(&mut self) -> Option<RouteNotification> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.accepts(&change) => {
                    return Some(RouteNotification::Changed(change))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(RouteNotification::Lagged(n))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next pending notification without waiting.
    pub fn try_recv(&mut self) -> Option<RouteNotification> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.accepts(&change) => {
                    return Some(RouteNotification::Changed(change))
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(RouteNotification::Lagged(n))
                }
                Err(_) => return None,
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
struct VrfRoutes {
    routes: HashMap<IpPrefix, Arc<RouteDecision>>,
    v4_lengths: BTreeSet<u8>,
    v6_lengths: BTreeSet<u8>,
}

impl VrfRoutes {
    fn lengths_mut(&mut self, prefix: &IpPrefix) -> &mut BTreeSet<u8> {
        if prefix.is_ipv4() {
            &mut self.v4_lengths
        } else {
            &mut self.v6_lengths
        }
    }

    fn lookup(&self, address: &IpAddress) -> Option<&Arc<RouteDecision>> {
        let lengths = if address.is_ipv4() {
            &self.v4_lengths
        } else {
            &self.v6_lengths
        };
        lengths.iter().rev().find_map(|len| {
            IpPrefix::covering(*address, *len).and_then(|prefix| self.routes.get(&prefix))
        })
    }

    fn insert(&mut self, decision: Arc<RouteDecision>) {
        let prefix = decision.route.prefix;
        self.lengths_mut(&prefix).insert(prefix.prefix_len());
        self.routes.insert(prefix, decision);
    }

    fn remove(&mut self, prefix: &IpPrefix) -> Option<Arc<RouteDecision>> {
        let removed = self.routes.remove(prefix)?;
        let len = prefix.prefix_len();
        let family_v4 = prefix.is_ipv4();
        let still_used = self
            .routes
            .keys()
            .any(|p| p.prefix_len() == len && p.is_ipv4() == family_v4);
        if !still_used {
            self.lengths_mut(prefix).remove(&len);
        }
        Some(removed)
    }
}

/// Immutable view of all routes at one instant.
#[derive(Debug, Default, Clone)]
pub struct RouteSnapshot {
    tables: HashMap<VrfId, Arc<VrfRoutes>>,
}

impl RouteSnapshot {
    /// Longest-prefix match of `address` in table `vrf`.
    pub fn lookup(&self, vrf: VrfId, address: &IpAddress) -> Option<Arc<RouteDecision>> {
        self.tables.get(&vrf)?.lookup(address).cloned()
    }

    /// Exact-match lookup of a route.
    pub fn get(&self, key: &RouteKey) -> Option<Arc<RouteDecision>> {
        self.tables.get(&key.vrf)?.routes.get(&key.prefix).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.tables.values().map(|t| t.routes.len()).sum()
    }

    pub fn has_vrf(&self, vrf: VrfId) -> bool {
        self.tables.contains_key(&vrf)
    }
}

/// Route store with lock-free reads and generation-stamped decisions.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
    generation: AtomicU64,
    control: Mutex<()>,
    changes: broadcast::Sender<RouteChange>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANGE_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
            generation: AtomicU64::new(0),
            control: Mutex::new(()),
            changes,
        }
    }

    /// Returns the current snapshot. It is never mutated after publication.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.snapshot.load_full()
    }

    /// Highest generation handed out so far.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn route_count(&self) -> usize {
        self.snapshot.load().route_count()
    }

    /// Exact-match lookup of a route's current decision.
    pub fn get(&self, key: &RouteKey) -> Option<Arc<RouteDecision>> {
        self.snapshot.load().get(key)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Applies `f` to a private copy of `vrf` and publishes the result.
    ///
    /// Must be called with the control mutex held.
    fn publish<F>(&self, vrf: VrfId, f: F) -> Result<RouteChange>
    where
        F: FnOnce(&mut VrfRoutes) -> Result<RouteChange>,
    {
        let current = self.snapshot.load_full();
        let mut routes = current
            .tables
            .get(&vrf)
            .map(|r| (**r).clone())
            .unwrap_or_default();
        let change = f(&mut routes)?;

        let mut next = (*current).clone();
        if routes.routes.is_empty() {
            next.tables.remove(&vrf);
        } else {
            next.tables.insert(vrf, Arc::new(routes));
        }
        self.snapshot.store(Arc::new(next));

        debug!(
            "RouteTable: {:?} {} generation {}",
            change.kind, change.route, change.generation
        );
        // No subscribers is not an error.
        let _ = self.changes.send(change.clone());
        Ok(change)
    }

    /// Installs or replaces the decision for a route.
    ///
    /// Group members are renumbered by position. Returns the new generation.
    pub fn set_route(&self, vrf: VrfId, prefix: IpPrefix, next_hop: NextHop) -> Result<u64> {
        let key = RouteKey::new(vrf, prefix);
        if next_hop.is_group() && next_hop.members().is_empty() {
            return Err(RouteError::EmptyGroup(key));
        }
        let next_hop = if next_hop.is_group() {
            NextHop::group(next_hop.components())
        } else {
            next_hop
        };

        let _guard = self.control.lock();
        let change = self.publish(vrf, |routes| {
            let generation = self.next_generation();
            routes.insert(Arc::new(RouteDecision::new(key, generation, next_hop)));
            Ok(RouteChange {
                route: key,
                generation,
                kind: RouteChangeKind::Updated,
            })
        })?;
        Ok(change.generation)
    }

    /// Installs or replaces a route with an ECMP group built from `components`.
    pub fn set_group(
        &self,
        vrf: VrfId,
        prefix: IpPrefix,
        components: impl IntoIterator<Item = ComponentKey>,
    ) -> Result<u64> {
        self.set_route(vrf, prefix, NextHop::group(components))
    }

    /// Appends a member to an existing group.
    pub fn add_group_member(
        &self,
        vrf: VrfId,
        prefix: IpPrefix,
        component: ComponentKey,
    ) -> Result<u64> {
        self.modify_group(vrf, prefix, |_, components| {
            components.push(component);
            Ok(())
        })
    }

    /// Removes the first member matching `endpoint` and `label`.
    ///
    /// Removing the last member is refused; withdraw the route instead.
    pub fn remove_group_member(
        &self,
        vrf: VrfId,
        prefix: IpPrefix,
        endpoint: IpAddress,
        label: u32,
    ) -> Result<u64> {
        self.modify_group(vrf, prefix, |key, components| {
            let position = components
                .iter()
                .position(|c| c.endpoint == endpoint && c.label == label)
                .ok_or(RouteError::MemberNotFound {
                    route: key,
                    endpoint,
                    label,
                })?;
            components.remove(position);
            if components.is_empty() {
                return Err(RouteError::EmptyGroup(key));
            }
            Ok(())
        })
    }

    fn modify_group<F>(&self, vrf: VrfId, prefix: IpPrefix, f: F) -> Result<u64>
    where
        F: FnOnce(RouteKey, &mut Vec<ComponentKey>) -> Result<()>,
    {
        let key = RouteKey::new(vrf, prefix);
        let _guard = self.control.lock();
        let change = self.publish(vrf, |routes| {
            let current = routes
                .routes
                .get(&prefix)
                .ok_or(RouteError::RouteNotFound(key))?;
            if !current.next_hop.is_group() {
                return Err(RouteError::NotAGroup(key));
            }
            let mut components = current.next_hop.components();
            f(key, &mut components)?;

            let generation = self.next_generation();
            routes.insert(Arc::new(RouteDecision::new(
                key,
                generation,
                NextHop::group(components),
            )));
            Ok(RouteChange {
                route: key,
                generation,
                kind: RouteChangeKind::Updated,
            })
        })?;
        Ok(change.generation)
    }

    /// Withdraws a route. Returns the generation stamped on the withdrawal.
    pub fn remove_route(&self, vrf: VrfId, prefix: IpPrefix) -> Result<u64> {
        let key = RouteKey::new(vrf, prefix);
        let _guard = self.control.lock();
        let change = self.publish(vrf, |routes| {
            routes
                .remove(&prefix)
                .ok_or(RouteError::RouteNotFound(key))?;
            Ok(RouteChange {
                route: key,
                generation: self.next_generation(),
                kind: RouteChangeKind::Withdrawn,
            })
        })?;
        Ok(change.generation)
    }

    /// Withdraws every route of a table. Returns the number withdrawn.
    pub fn remove_vrf(&self, vrf: VrfId) -> usize {
        let _guard = self.control.lock();
        let current = self.snapshot.load_full();
        let Some(routes) = current.tables.get(&vrf) else {
            return 0;
        };
        let withdrawn: Vec<RouteKey> = routes.routes.values().map(|d| d.route).collect();

        let mut next = (*current).clone();
        next.tables.remove(&vrf);
        self.snapshot.store(Arc::new(next));

        for route in &withdrawn {
            let _ = self.changes.send(RouteChange {
                route: *route,
                generation: self.next_generation(),
                kind: RouteChangeKind::Withdrawn,
            });
        }
        info!("RouteTable: removed vrf {} ({} routes)", vrf, withdrawn.len());
        withdrawn.len()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteSnapshotProvider for RouteTable {
    fn lookup_decision(&self, vrf: VrfId, address: &IpAddress) -> Option<Arc<RouteDecision>> {
        self.snapshot.load().lookup(vrf, address)
    }

    fn subscribe(&self) -> RouteChangeStream {
        RouteChangeStream::new(self.changes.subscribe())
    }
}
