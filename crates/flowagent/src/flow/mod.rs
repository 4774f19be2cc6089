//! Flow records, pair resolution and per-partition flow tables.
//!
//! A conversation is tracked as two records, forward and reverse, owned by
//! the same [`FlowTable`]. Each record binds the route decision its
//! direction forwards with. A record that received tunnelled traffic also
//! carries the position of the upstream peer within the decision bound by
//! its partner, which is the route back toward that peer.

mod event;
mod key;
mod record;
mod resolver;
mod short_flow;
mod table;

pub use event::FlowEvent;
pub use key::{FlowKey, IngressContext, Packet, TunnelOrigin};
pub use record::{Binding, Direction, FlowRecord, FlowView, MemberIndex};
pub use resolver::{match_member, DirectionInput, Resolution, ResolveError, Resolver};
pub use short_flow::{EvictReason, FlowState, ShortFlowReason};
pub use table::{FlowError, FlowTable, FlowTableConfig, IndexChange, Result};
