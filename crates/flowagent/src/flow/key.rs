//! Flow classification and packet metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use vrouter_types::{IpAddress, IpProtocol, VrfId};

/// Canonical classification of one direction of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    /// Table the packet was received in.
    pub vrf: VrfId,
    pub src: IpAddress,
    pub dst: IpAddress,
    pub protocol: IpProtocol,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(vrf: VrfId, src: IpAddress, dst: IpAddress, protocol: IpProtocol) -> Self {
        Self {
            vrf,
            src,
            dst,
            protocol,
            src_port: 0,
            dst_port: 0,
        }
    }

    pub fn with_ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    /// The same conversation seen from the other end, in the same table.
    pub fn reverse(&self) -> Self {
        Self {
            vrf: self.vrf,
            src: self.dst,
            dst: self.src,
            protocol: self.protocol,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Returns a copy with the table and addresses replaced.
    pub fn rewritten(&self, vrf: VrfId, src: IpAddress, dst: IpAddress) -> Self {
        Self {
            vrf,
            src,
            dst,
            ..*self
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol.has_ports() {
            write!(
                f,
                "vrf:{} {}:{} -> {}:{} {}",
                self.vrf, self.src, self.src_port, self.dst, self.dst_port, self.protocol
            )
        } else {
            write!(
                f,
                "vrf:{} {} -> {} {}",
                self.vrf, self.src, self.dst, self.protocol
            )
        }
    }
}

/// Where a packet entered the router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngressContext {
    /// Receiving interface, if known.
    pub interface: Option<String>,
}

impl IngressContext {
    pub fn interface(name: impl Into<String>) -> Self {
        Self {
            interface: Some(name.into()),
        }
    }

    pub fn is_known(&self) -> bool {
        self.interface.is_some()
    }
}

impl fmt::Display for IngressContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interface {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "unknown"),
        }
    }
}

/// Outer-header metadata of a tunnel-received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelOrigin {
    /// Source address of the outer header (the upstream peer).
    pub address: IpAddress,
    /// Label carried by the packet, if the encapsulation has one.
    #[serde(default)]
    pub label: Option<u32>,
}

impl TunnelOrigin {
    pub fn new(address: IpAddress) -> Self {
        Self {
            address,
            label: None,
        }
    }

    pub fn with_label(mut self, label: u32) -> Self {
        self.label = Some(label);
        self
    }
}

impl fmt::Display for TunnelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(f, "{}+{}", self.address, label),
            None => write!(f, "{}", self.address),
        }
    }
}

/// A classified packet handed to the flow table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub key: FlowKey,
    #[serde(default)]
    pub tunnel_origin: Option<TunnelOrigin>,
    #[serde(default)]
    pub ingress: IngressContext,
}

impl Packet {
    /// A packet sent by a locally attached endpoint.
    pub fn local(key: FlowKey, ingress: IngressContext) -> Self {
        Self {
            key,
            tunnel_origin: None,
            ingress,
        }
    }

    /// A packet received over a tunnel from `origin`.
    pub fn tunnel(key: FlowKey, origin: TunnelOrigin, ingress: IngressContext) -> Self {
        Self {
            key,
            tunnel_origin: Some(origin),
            ingress,
        }
    }

    pub fn is_tunnelled(&self) -> bool {
        self.tunnel_origin.is_some()
    }
}
