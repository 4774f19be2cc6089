//! Floating-IP translation.
//!
//! A floating IP exposes a fixed interface address in another table. The
//! mapping is used both ways: a floating address translates to the fixed
//! address in the interface's table, and a fixed address translates to its
//! floating address in the floating network's table.

use arc_swap::ArcSwap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use vrouter_types::{IpAddress, VrfId};

/// Translates an address into the (table, address) pair that replaces it.
pub trait AddressTranslator: Send + Sync {
    fn translate(&self, vrf: VrfId, address: &IpAddress) -> Option<(VrfId, IpAddress)>;
}

/// One floating-IP association.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FloatingIp {
    pub floating_vrf: VrfId,
    pub floating_address: IpAddress,
    pub interface_vrf: VrfId,
    pub fixed_address: IpAddress,
}

impl FloatingIp {
    fn floating_key(&self) -> (VrfId, IpAddress) {
        (self.floating_vrf, self.floating_address)
    }

    fn fixed_key(&self) -> (VrfId, IpAddress) {
        (self.interface_vrf, self.fixed_address)
    }
}

#[derive(Debug, Default, Clone)]
struct FloatingIpMap {
    by_floating: HashMap<(VrfId, IpAddress), FloatingIp>,
    // A fixed address may carry several floating IPs; the smallest
    // (table, address) is used for translation.
    by_fixed: HashMap<(VrfId, IpAddress), BTreeSet<(VrfId, IpAddress)>>,
}

impl FloatingIpMap {
    fn unlink(&mut self, fip: &FloatingIp) {
        if let Some(set) = self.by_fixed.get_mut(&fip.fixed_key()) {
            set.remove(&fip.floating_key());
            if set.is_empty() {
                self.by_fixed.remove(&fip.fixed_key());
            }
        }
    }
}

/// In-memory floating-IP table.
#[derive(Default)]
pub struct FloatingIpTable {
    map: ArcSwap<FloatingIpMap>,
    control: Mutex<()>,
}

impl FloatingIpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a floating IP, replacing an existing association of the
    /// same floating address.
    pub fn add(&self, fip: FloatingIp) -> Option<FloatingIp> {
        let _guard = self.control.lock();
        let mut map = (**self.map.load()).clone();
        let replaced = map.by_floating.remove(&fip.floating_key());
        if let Some(old) = &replaced {
            map.unlink(old);
        }
        map.by_fixed
            .entry(fip.fixed_key())
            .or_default()
            .insert(fip.floating_key());
        debug!(
            "FloatingIpTable: vrf:{} {} <-> vrf:{} {}",
            fip.floating_vrf, fip.floating_address, fip.interface_vrf, fip.fixed_address
        );
        map.by_floating.insert(fip.floating_key(), fip);
        self.map.store(Arc::new(map));
        replaced
    }

    pub fn remove(&self, floating_vrf: VrfId, floating_address: IpAddress) -> Option<FloatingIp> {
        let _guard = self.control.lock();
        let mut map = (**self.map.load()).clone();
        let removed = map.by_floating.remove(&(floating_vrf, floating_address))?;
        map.unlink(&removed);
        self.map.store(Arc::new(map));
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.map.load().by_floating.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().by_floating.is_empty()
    }
}

impl AddressTranslator for FloatingIpTable {
    fn translate(&self, vrf: VrfId, address: &IpAddress) -> Option<(VrfId, IpAddress)> {
        let map = self.map.load();
        if let Some(fip) = map.by_floating.get(&(vrf, *address)) {
            return Some(fip.fixed_key());
        }
        map.by_fixed
            .get(&(vrf, *address))
            .and_then(|set| set.iter().next().copied())
    }
}
