//! Next-hop variants: single paths and ECMP group members.

use serde::{Deserialize, Serialize};
use std::fmt;
use vrouter_types::IpAddress;

/// Set of tunnel encapsulations a member accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelTypes(u8);

impl TunnelTypes {
    pub const NONE: Self = Self(0);
    /// MPLS over GRE.
    pub const MPLS_GRE: Self = Self(1 << 0);
    /// MPLS over UDP.
    pub const MPLS_UDP: Self = Self(1 << 1);
    /// VXLAN.
    pub const VXLAN: Self = Self(1 << 2);
    pub const ALL: Self = Self(Self::MPLS_GRE.0 | Self::MPLS_UDP.0 | Self::VXLAN.0);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for TunnelTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::ops::BitOr for TunnelTypes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for TunnelTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::MPLS_GRE, "MPLSoGRE"),
            (Self::MPLS_UDP, "MPLSoUDP"),
            (Self::VXLAN, "VXLAN"),
        ]
        .iter()
        .filter(|(t, _)| self.contains(*t))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Component of an ECMP group as configured by the control path.
///
/// Carries no position; positions are assigned when the group is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentKey {
    /// Tunnel endpoint of the upstream peer.
    pub endpoint: IpAddress,
    /// Label the peer expects on tunnelled traffic.
    pub label: u32,
    #[serde(default)]
    pub encapsulations: TunnelTypes,
}

impl ComponentKey {
    pub fn new(endpoint: IpAddress, label: u32) -> Self {
        Self {
            endpoint,
            label,
            encapsulations: TunnelTypes::ALL,
        }
    }

    pub fn with_encapsulations(mut self, encapsulations: TunnelTypes) -> Self {
        self.encapsulations = encapsulations;
        self
    }
}

/// A member of a published ECMP group.
///
/// `index` is the member's current position in the group. It is reassigned
/// whenever the group changes and must not be used as a stable identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub index: usize,
    pub endpoint: IpAddress,
    pub label: u32,
    pub encapsulations: TunnelTypes,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}+{}", self.index, self.endpoint, self.label)
    }
}

/// A single forwarding path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Path {
    /// Remote destination behind a tunnel endpoint.
    Tunnel {
        endpoint: IpAddress,
        label: u32,
        #[serde(default)]
        encapsulations: TunnelTypes,
    },
    /// Destination attached to a local interface.
    Interface { name: String },
}

impl Path {
    pub fn tunnel(endpoint: IpAddress, label: u32) -> Self {
        Path::Tunnel {
            endpoint,
            label,
            encapsulations: TunnelTypes::ALL,
        }
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Path::Interface { name: name.into() }
    }

    /// Tunnel endpoint of this path, if it leaves through a tunnel.
    pub fn endpoint(&self) -> Option<&IpAddress> {
        match self {
            Path::Tunnel { endpoint, .. } => Some(endpoint),
            Path::Interface { .. } => None,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::Tunnel {
                endpoint, label, ..
            } => write!(f, "tunnel {}+{}", endpoint, label),
            Path::Interface { name } => write!(f, "interface {}", name),
        }
    }
}

/// The active forwarding decision for a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NextHop {
    Single(Path),
    Group(Vec<Member>),
}

impl NextHop {
    /// Builds a group from components, assigning contiguous positions.
    pub fn group(components: impl IntoIterator<Item = ComponentKey>) -> Self {
        NextHop::Group(
            components
                .into_iter()
                .enumerate()
                .map(|(index, c)| Member {
                    index,
                    endpoint: c.endpoint,
                    label: c.label,
                    encapsulations: c.encapsulations,
                })
                .collect(),
        )
    }

    pub fn is_group(&self) -> bool {
        matches!(self, NextHop::Group(_))
    }

    /// Group members in position order; empty for a single path.
    pub fn members(&self) -> &[Member] {
        match self {
            NextHop::Group(members) => members,
            NextHop::Single(_) => &[],
        }
    }

    /// Returns true if traffic from `endpoint` is a valid return path.
    pub fn has_endpoint(&self, endpoint: &IpAddress) -> bool {
        match self {
            NextHop::Single(path) => path.endpoint() == Some(endpoint),
            NextHop::Group(members) => members.iter().any(|m| &m.endpoint == endpoint),
        }
    }

    /// The components this group was built from, in position order.
    pub fn components(&self) -> Vec<ComponentKey> {
        self.members()
            .iter()
            .map(|m| ComponentKey {
                endpoint: m.endpoint,
                label: m.label,
                encapsulations: m.encapsulations,
            })
            .collect()
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextHop::Single(path) => write!(f, "{}", path),
            NextHop::Group(members) => {
                let parts: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                write!(f, "ecmp[{}]", parts.join(","))
            }
        }
    }
}
