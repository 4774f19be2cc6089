//! Route state consumed by flow resolution.
//!
//! A route's active decision is either a single path or an ECMP group whose
//! members carry their current position. Decisions are published as
//! immutable, generation-stamped snapshots so flow bindings can detect when
//! the decision they hold has been replaced.

mod decision;
mod nexthop;
mod table;

pub use decision::{RouteDecision, RouteKey};
pub use nexthop::{ComponentKey, Member, NextHop, Path, TunnelTypes};
pub use table::{
    Result, RouteChange, RouteChangeKind, RouteChangeStream, RouteError, RouteNotification,
    RouteSnapshot, RouteSnapshotProvider, RouteTable, DEFAULT_CHANGE_CHANNEL_CAPACITY,
};
