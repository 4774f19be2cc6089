//! Async runtime around the flow agent.

mod flowdaemon;

pub use flowdaemon::{FlowDaemon, PacketSender};
