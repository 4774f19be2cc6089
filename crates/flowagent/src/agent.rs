//! Partitioned flow table owner.
//!
//! Flows are spread over independently locked [`FlowTable`] partitions. A
//! new conversation is placed by a hash of its key and its derived reverse
//! key taken in order, so both directions agree on a home even when the
//! reverse key is translated. Every key of an existing pair is recorded in a
//! locator. A key whose reverse is already held by a pair is sent to that
//! pair's partition, which then applies its own claimed-key policy.
//!
//! Placement and creation of new pairs are serialised by one lock, so two
//! first packets of the same conversation cannot both miss the locator.

use ahash::AHasher;
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::time::Instant;
use tokio::sync::broadcast;
use vrouter_types::VrfId;

use crate::config::{ConfigError, FlowAgentConfig};
use crate::flow::{
    FlowError, FlowEvent, FlowKey, FlowRecord, FlowTable, FlowView, IndexChange, Packet,
    Resolver, Result, TunnelOrigin,
};
use crate::route::{RouteChangeStream, RouteNotification};

/// Depth of the flow event channel.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Owner of all flow partitions.
pub struct FlowAgent {
    config: FlowAgentConfig,
    resolver: Resolver,
    partitions: Vec<Mutex<FlowTable>>,
    locator: DashMap<FlowKey, usize>,
    /// Held while placing and creating pairs for keys the locator misses.
    placement: Mutex<()>,
    events: broadcast::Sender<FlowEvent>,
}

impl FlowAgent {
    pub fn new(config: FlowAgentConfig, resolver: Resolver) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let partitions = (0..config.partitions)
            .map(|p| Mutex::new(FlowTable::new(p, config.table_config()).with_events(events.clone())))
            .collect();
        info!(
            "FlowAgent: {} partitions, {} records each",
            config.partitions, config.max_flows_per_partition
        );
        Ok(Self {
            config,
            resolver,
            partitions,
            locator: DashMap::new(),
            placement: Mutex::new(()),
            events,
        })
    }

    pub fn config(&self) -> &FlowAgentConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Subscribes to pair lifecycle events of all partitions.
    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Partition that owns, or would own, the pair of `key`.
    pub fn partition_for(&self, key: &FlowKey) -> usize {
        if let Some(partition) = self.locate(key) {
            return partition;
        }
        let reverse = self.resolver.chain().reverse_key(key);
        self.locate(&reverse)
            .unwrap_or_else(|| self.home_partition(key, &reverse))
    }

    fn locate(&self, key: &FlowKey) -> Option<usize> {
        self.locator.get(key).map(|p| *p)
    }

    /// Hash placement of a conversation given both of its keys; the result
    /// does not depend on which direction is seen first.
    fn home_partition(&self, key: &FlowKey, reverse: &FlowKey) -> usize {
        let (lo, hi) = if key <= reverse { (key, reverse) } else { (reverse, key) };
        let mut hasher = AHasher::default();
        lo.hash(&mut hasher);
        hi.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions.len()
    }

    /// Runs `f` on partition `partition` and mirrors its key changes into
    /// the locator before releasing the partition.
    fn with_partition<F, R>(&self, partition: usize, f: F) -> R
    where
        F: FnOnce(&mut FlowTable, &Resolver) -> R,
    {
        let mut table = self.partitions[partition].lock();
        let result = f(&mut table, &self.resolver);
        for change in table.drain_index_changes() {
            match change {
                IndexChange::Added(key) => {
                    if let Some(previous) = self.locator.insert(key, partition) {
                        if previous != partition {
                            warn!(
                                "FlowAgent: [{}] moved from partition {} to {}",
                                key, previous, partition
                            );
                        }
                    }
                }
                IndexChange::Removed(key) => {
                    self.locator.remove_if(&key, |_, owner| *owner == partition);
                }
            }
        }
        result
    }

    /// Handles a packet in the partition that owns its conversation.
    pub fn process_packet(&self, packet: &Packet, now: Instant) -> Result<FlowView> {
        if let Some(partition) = self.locate(&packet.key) {
            // The pair may be removed between the lookup and the lock.
            let existing = self.with_partition(partition, |table, resolver| {
                table
                    .contains(&packet.key)
                    .then(|| table.process_packet(packet, resolver, now))
            });
            if let Some(result) = existing {
                return result;
            }
        }

        let _placement = self.placement.lock();
        let partition = self.partition_for(&packet.key);
        self.with_partition(partition, |table, resolver| {
            table.process_packet(packet, resolver, now)
        })
    }

    /// Current view of a record, refreshed if its pair is stale.
    pub fn view(&self, key: &FlowKey) -> Option<FlowView> {
        let partition = *self.locator.get(key)?;
        self.with_partition(partition, |table, resolver| table.view(key, resolver))
    }

    /// Copy of a record as stored, without refreshing.
    pub fn record(&self, key: &FlowKey) -> Option<FlowRecord> {
        let partition = *self.locator.get(key)?;
        self.partitions[partition].lock().record(key).cloned()
    }

    /// Copy of the record paired with `key`'s record.
    pub fn partner(&self, key: &FlowKey) -> Option<FlowRecord> {
        let partition = *self.locator.get(key)?;
        self.partitions[partition].lock().partner(key).cloned()
    }

    pub fn rpf_check(&self, key: &FlowKey, origin: &TunnelOrigin) -> Result<bool> {
        let partition = self
            .locator
            .get(key)
            .map(|p| *p)
            .ok_or(FlowError::FlowNotFound(*key))?;
        self.with_partition(partition, |table, resolver| {
            table.rpf_check(key, origin, resolver)
        })
    }

    /// Removes the pair `key` belongs to.
    pub fn invalidate_pair(&self, key: &FlowKey) -> Option<FlowView> {
        let partition = *self.locator.get(key)?;
        self.with_partition(partition, |table, _| table.invalidate_pair(key))
    }

    /// Removes every pair with a record in table `vrf`.
    pub fn invalidate_table(&self, vrf: VrfId) -> usize {
        (0..self.partitions.len())
            .map(|p| self.with_partition(p, |table, _| table.invalidate_table(vrf)))
            .sum()
    }

    /// Ages out idle pairs in every partition.
    pub fn sweep(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout();
        (0..self.partitions.len())
            .map(|p| self.with_partition(p, |table, _| table.sweep(now, idle_timeout)))
            .sum()
    }

    /// Applies a route notification to every partition. Returns the number
    /// of evicted pairs.
    pub fn handle_route_notification(&self, notification: &RouteNotification) -> usize {
        match notification {
            RouteNotification::Changed(change) => (0..self.partitions.len())
                .map(|p| {
                    self.with_partition(p, |table, resolver| {
                        table.on_route_change(change, resolver)
                    })
                })
                .sum(),
            RouteNotification::Lagged(missed) => {
                warn!(
                    "FlowAgent: missed {} route changes, marking all flows stale",
                    missed
                );
                for p in 0..self.partitions.len() {
                    self.with_partition(p, |table, _| table.mark_all_stale());
                }
                0
            }
        }
    }

    /// Applies every pending notification of `stream` without waiting.
    pub fn drain_route_notifications(&self, stream: &mut RouteChangeStream) -> usize {
        let mut evicted = 0;
        while let Some(notification) = stream.try_recv() {
            evicted += self.handle_route_notification(&notification);
        }
        evicted
    }

    /// Total number of records (two per pair).
    pub fn flow_count(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn pair_count(&self) -> usize {
        self.flow_count() / 2
    }
}
