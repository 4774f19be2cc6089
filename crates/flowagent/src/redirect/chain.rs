//! Lookup target computation for one flow direction.
//!
//! Floating-IP translation is applied first: the destination is translated
//! if it has a mapping, otherwise a mapped source moves the lookup into the
//! source's floating table. VRF-assign classification then runs against the
//! translated key and may substitute the table once more.

use std::fmt;
use std::sync::Arc;
use vrouter_types::{IpAddress, VrfId};

use super::acl::{VrfAssignAcl, VrfClassifier};
use super::floating_ip::{AddressTranslator, FloatingIpTable};
use crate::flow::{FlowKey, IngressContext};

/// The (table, address) pair a direction's route lookup actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupTarget {
    pub vrf: VrfId,
    pub address: IpAddress,
    /// Floating-IP translation changed the table or address.
    pub translated: bool,
    /// A VRF-assign rule changed the table.
    pub redirected: bool,
}

impl LookupTarget {
    pub fn direct(vrf: VrfId, address: IpAddress) -> Self {
        Self {
            vrf,
            address,
            translated: false,
            redirected: false,
        }
    }

    /// Returns true if any chain stage replaced the original target.
    pub fn is_substituted(&self) -> bool {
        self.translated || self.redirected
    }
}

impl fmt::Display for LookupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vrf:{} {}", self.vrf, self.address)?;
        if self.translated {
            write!(f, " (translated)")?;
        }
        if self.redirected {
            write!(f, " (redirected)")?;
        }
        Ok(())
    }
}

/// Redirect and translation stages applied before every route lookup.
#[derive(Clone)]
pub struct RedirectChain {
    classifier: Arc<dyn VrfClassifier>,
    translator: Arc<dyn AddressTranslator>,
}

impl RedirectChain {
    pub fn new(classifier: Arc<dyn VrfClassifier>, translator: Arc<dyn AddressTranslator>) -> Self {
        Self {
            classifier,
            translator,
        }
    }

    /// A chain with no rules and no translations.
    pub fn passthrough() -> Self {
        Self::new(
            Arc::new(VrfAssignAcl::new()),
            Arc::new(FloatingIpTable::new()),
        )
    }

    /// Computes the lookup target for packets classified as `key`.
    ///
    /// Evaluated against the current rule and translation state on every call.
    pub fn lookup_target(&self, key: &FlowKey, ingress: &IngressContext) -> LookupTarget {
        let (translated_key, translated) =
            if let Some((vrf, dst)) = self.translator.translate(key.vrf, &key.dst) {
                (key.rewritten(vrf, key.src, dst), true)
            } else if let Some((vrf, src)) = self.translator.translate(key.vrf, &key.src) {
                (key.rewritten(vrf, src, key.dst), true)
            } else {
                (*key, false)
            };

        match self.classifier.classify(&translated_key, ingress) {
            Some(vrf) if vrf != translated_key.vrf => LookupTarget {
                vrf,
                address: translated_key.dst,
                translated,
                redirected: true,
            },
            _ => LookupTarget {
                vrf: translated_key.vrf,
                address: translated_key.dst,
                translated,
                redirected: false,
            },
        }
    }

    /// Derives the key of the opposite direction of a conversation.
    ///
    /// A conversation addressed to a floating IP pairs with the fixed-address
    /// key in the interface's table, and vice versa.
    pub fn reverse_key(&self, key: &FlowKey) -> FlowKey {
        let reverse = key.reverse();
        if let Some((vrf, dst)) = self.translator.translate(key.vrf, &key.dst) {
            return reverse.rewritten(vrf, dst, reverse.dst);
        }
        if let Some((vrf, src)) = self.translator.translate(key.vrf, &key.src) {
            return reverse.rewritten(vrf, reverse.src, src);
        }
        reverse
    }
}

impl fmt::Debug for RedirectChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedirectChain").finish_non_exhaustive()
    }
}
