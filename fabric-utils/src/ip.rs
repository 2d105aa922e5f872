//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

// Address Family identifier.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

// Extension methods for IpAddr.
pub trait IpAddrExt {
    // Converts this IP address into a host prefix network.
    fn to_host_prefix(&self) -> IpNetwork;
}

// Extension methods for IpNetwork.
pub trait IpNetworkExt {
    // Returns true if this network contains the `other` network in its
    // entirety (equal networks are covered).
    fn covers(&self, other: &IpNetwork) -> bool;

    // Returns the address family of this network.
    fn address_family(&self) -> AddressFamily;
}

// ===== impl AddressFamily =====

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

// ===== impl IpAddr =====

impl IpAddrExt for IpAddr {
    fn to_host_prefix(&self) -> IpNetwork {
        let prefixlen = match self {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        IpNetwork::new(*self, prefixlen).unwrap()
    }
}

// ===== impl IpNetwork =====

impl IpNetworkExt for IpNetwork {
    fn covers(&self, other: &IpNetwork) -> bool {
        match (self, other) {
            (IpNetwork::V4(sup), IpNetwork::V4(sub)) => {
                sup.prefix() <= sub.prefix() && sup.contains(sub.network())
            }
            (IpNetwork::V6(sup), IpNetwork::V6(sub)) => {
                sup.prefix() <= sub.prefix() && sup.contains(sub.network())
            }
            _ => false,
        }
    }

    fn address_family(&self) -> AddressFamily {
        match self {
            IpNetwork::V4(_) => AddressFamily::Ipv4,
            IpNetwork::V6(_) => AddressFamily::Ipv6,
        }
    }
}
