//! vRouter flow agent - ECMP flow resolution core
//!
//! Tracks bidirectional flows in a virtual router and keeps, for every flow,
//! the route decision it forwards with and the ECMP member that points back
//! at the peer it came from.
//!
//! # Architecture
//!
//! ```text
//! [RouteTable] ──snapshots──> [Resolver] <── [RedirectChain]
//!      │                          │          (floating IP, VRF-assign ACL)
//!   changes                       ↓
//!      └──────────────> [FlowAgent: partitioned FlowTables] <── packets
//!                                 │
//!                                 ↓
//!                            FlowEvents
//! ```
//!
//! # Key Components
//!
//! - [`route::RouteTable`]: Route decisions published as generation-stamped snapshots
//! - [`redirect::RedirectChain`]: Translation and VRF reassignment before lookup
//! - [`flow::Resolver`]: Computes decisions and member indices for a flow pair
//! - [`flow::FlowTable`]: One partition of paired flow records
//! - [`agent::FlowAgent`]: Owner of all partitions
//! - [`daemon::FlowDaemon`]: Packet workers, aging and route listener tasks

pub mod agent;
pub mod config;
pub mod daemon;
pub mod flow;
pub mod redirect;
pub mod route;

pub use agent::FlowAgent;
pub use config::{ConfigError, FlowAgentConfig};
pub use daemon::{FlowDaemon, PacketSender};
pub use flow::{FlowKey, FlowView, MemberIndex, Packet, Resolver};
pub use route::RouteTable;
