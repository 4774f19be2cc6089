//! ACL VRF-assign rules.
//!
//! A matching rule moves the destination lookup of a flow into another
//! table. Rules are evaluated in ascending `id` order and the first match
//! wins.

use arc_swap::ArcSwap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vrouter_types::{IpPrefix, IpProtocol, VrfId};

use crate::flow::{FlowKey, IngressContext};

/// Decides whether a flow's lookup is redirected to another table.
pub trait VrfClassifier: Send + Sync {
    /// Returns the table the lookup must use instead of `key.vrf`, if any.
    fn classify(&self, key: &FlowKey, ingress: &IngressContext) -> Option<VrfId>;
}

/// A VRF-assign rule. Unset match fields are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfAssignRule {
    pub id: u32,
    /// Table whose traffic this rule classifies.
    pub vrf: VrfId,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub src: Option<IpPrefix>,
    #[serde(default)]
    pub dst: Option<IpPrefix>,
    #[serde(default)]
    pub protocol: Option<IpProtocol>,
    pub target_vrf: VrfId,
}

impl VrfAssignRule {
    pub fn new(id: u32, vrf: VrfId, target_vrf: VrfId) -> Self {
        Self {
            id,
            vrf,
            interface: None,
            src: None,
            dst: None,
            protocol: None,
            target_vrf,
        }
    }

    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interface = Some(name.into());
        self
    }

    pub fn src(mut self, prefix: IpPrefix) -> Self {
        self.src = Some(prefix);
        self
    }

    pub fn dst(mut self, prefix: IpPrefix) -> Self {
        self.dst = Some(prefix);
        self
    }

    pub fn protocol(mut self, protocol: IpProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn matches(&self, key: &FlowKey, ingress: &IngressContext) -> bool {
        if key.vrf != self.vrf {
            return false;
        }
        if let Some(name) = &self.interface {
            if ingress.interface.as_ref() != Some(name) {
                return false;
            }
        }
        if let Some(src) = &self.src {
            if !src.contains(&key.src) {
                return false;
            }
        }
        if let Some(dst) = &self.dst {
            if !dst.contains(&key.dst) {
                return false;
            }
        }
        self.protocol.map_or(true, |p| p == key.protocol)
    }
}

/// In-memory VRF-assign rule set.
#[derive(Default)]
pub struct VrfAssignAcl {
    rules: ArcSwap<Vec<VrfAssignRule>>,
    control: Mutex<()>,
}

impl VrfAssignAcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a rule, replacing any rule with the same id.
    pub fn add_rule(&self, rule: VrfAssignRule) -> Option<VrfAssignRule> {
        let _guard = self.control.lock();
        let mut rules = (**self.rules.load()).clone();
        let replaced = rules
            .iter()
            .position(|r| r.id == rule.id)
            .map(|pos| rules.remove(pos));
        debug!(
            "VrfAssignAcl: rule {} vrf {} -> {}",
            rule.id, rule.vrf, rule.target_vrf
        );
        rules.push(rule);
        rules.sort_by_key(|r| r.id);
        self.rules.store(Arc::new(rules));
        replaced
    }

    pub fn remove_rule(&self, id: u32) -> Option<VrfAssignRule> {
        let _guard = self.control.lock();
        let mut rules = (**self.rules.load()).clone();
        let pos = rules.iter().position(|r| r.id == id)?;
        let removed = rules.remove(pos);
        self.rules.store(Arc::new(rules));
        debug!("VrfAssignAcl: removed rule {}", id);
        Some(removed)
    }

    /// Current rules in evaluation order.
    pub fn rules(&self) -> Arc<Vec<VrfAssignRule>> {
        self.rules.load_full()
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.load().is_empty()
    }
}

impl VrfClassifier for VrfAssignAcl {
    fn classify(&self, key: &FlowKey, ingress: &IngressContext) -> Option<VrfId> {
        self.rules
            .load()
            .iter()
            .find(|r| r.matches(key, ingress))
            .map(|r| r.target_vrf)
    }
}
