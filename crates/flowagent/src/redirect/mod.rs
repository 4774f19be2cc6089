//! Redirect and translation stages between a flow key and its route lookup.

mod acl;
mod chain;
mod floating_ip;

pub use acl::{VrfAssignAcl, VrfAssignRule, VrfClassifier};
pub use chain::{LookupTarget, RedirectChain};
pub use floating_ip::{AddressTranslator, FloatingIp, FloatingIpTable};
