//! Common vRouter types for flow and route handling.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the flow agent crates:
//!
//! - [`IpPrefix`]: normalised IP network prefixes with containment checks
//! - [`IpProtocol`]: IP protocol numbers carried in flow keys
//! - [`VrfId`]: routing table (VRF) identifiers

mod ip;
mod protocol;

pub use ip::{mask_address, IpPrefix};
pub use protocol::IpProtocol;

pub use std::net::IpAddr as IpAddress;

/// Identifier of a routing table (VRF).
pub type VrfId = u32;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid IP protocol: {0}")]
    InvalidProtocol(String),
}
