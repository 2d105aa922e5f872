//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use derive_new::new;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::agent::{MplsRoute, UnicastRoute};
use crate::mpls::{Label, MplsAction};

// Identity of a route announcement: the announcing node and the area the
// announcement was received in. Totally ordered by the lexicographic pair.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct NodeAndArea {
    pub node: String,
    pub area: String,
}

// How packets toward a prefix are forwarded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ForwardingType {
    #[default]
    Ip,
    SrMpls,
}

// Which path computation feeds the next-hop set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ForwardingAlgorithm {
    #[default]
    SpEcmp,
    Ksp2EdEcmp,
}

// Announcement metric vector. Higher preferences win; lower distance wins.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct PrefixMetrics {
    pub path_preference: i64,
    pub source_preference: i64,
    pub distance: i64,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct PrefixEntryFlags: u8 {
        const DO_NOT_INSTALL = 0x01;
        const BGP = 0x02;
    }
}

// Opaque BGP attribute summary carried by BGP-flagged announcements.
//
// Selection beyond path/source preference and IGP distance is delegated to a
// pluggable comparator over this struct; the fields are not interpreted
// anywhere else.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct BgpAttrs {
    pub as_path_len: u32,
    pub origin: u8,
    pub med: u32,
    pub originator_id: u32,
    pub cluster_list_len: u32,
}

// One route announcement for a prefix.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct PrefixEntry {
    pub prefix: IpNetwork,
    pub forwarding_type: ForwardingType,
    pub forwarding_algorithm: ForwardingAlgorithm,
    pub metrics: PrefixMetrics,
    pub flags: PrefixEntryFlags,
    pub bgp_attrs: Option<BgpAttrs>,
    pub min_nexthops: Option<usize>,
}

// Next-hop of a computed route.
//
// Equality, ordering and hashing deliberately ignore `metric`: two next-hops
// differing only in metric are the same forwarding entry, and sets keyed this
// way deduplicate accordingly.
#[derive(Clone, Debug, new)]
#[derive(Deserialize, Serialize)]
pub struct NextHop {
    pub addr: IpAddr,
    pub ifname: String,
    pub weight: u32,
    pub mpls_action: Option<MplsAction>,
    pub metric: u32,
}

// Computed unicast route.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct RibUnicastEntry {
    pub prefix: IpNetwork,
    pub nexthops: BTreeSet<NextHop>,
    pub best_prefix_entry: PrefixEntry,
    pub best_node_area: NodeAndArea,
    pub do_not_install: bool,
}

// Computed MPLS route.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct RibMplsEntry {
    pub label: Label,
    pub nexthops: BTreeSet<NextHop>,
}

// Incremental change to the route database.
//
// Applying a stream of updates in order, starting from an empty database,
// reconstructs the full database.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct RouteUpdate {
    pub unicast_upserts: BTreeMap<IpNetwork, RibUnicastEntry>,
    pub unicast_deletions: Vec<IpNetwork>,
    pub mpls_upserts: BTreeMap<Label, RibMplsEntry>,
    pub mpls_deletions: Vec<Label>,
    pub perf_events: Option<PerfEvents>,
}

// Timestamped trace of one update's trip through the control plane.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct PerfEvents {
    pub events: Vec<PerfEvent>,
}

#[derive(Clone, Debug, new)]
#[derive(Deserialize, Serialize)]
pub struct PerfEvent {
    pub node: String,
    pub event: String,
    pub ts: DateTime<Utc>,
}

// Full route database snapshots, plain and detailed.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct RouteDatabase {
    pub unicast: Vec<UnicastRoute>,
    pub mpls: Vec<MplsRoute>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct RouteDatabaseDetail {
    pub unicast: Vec<RibUnicastEntry>,
    pub mpls: Vec<RibMplsEntry>,
}

// Plain delta published to FIB stream subscribers.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct RouteDatabaseDelta {
    pub unicast_upserts: Vec<UnicastRoute>,
    pub unicast_deletions: Vec<IpNetwork>,
    pub mpls_upserts: Vec<MplsRoute>,
    pub mpls_deletions: Vec<Label>,
}

// ===== impl NextHop =====

impl NextHop {
    fn key(&self) -> (&IpAddr, &str, u32, &Option<MplsAction>) {
        (&self.addr, &self.ifname, self.weight, &self.mpls_action)
    }
}

impl PartialEq for NextHop {
    fn eq(&self, other: &NextHop) -> bool {
        self.key() == other.key()
    }
}

impl Eq for NextHop {}

impl Ord for NextHop {
    fn cmp(&self, other: &NextHop) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for NextHop {
    fn partial_cmp(&self, other: &NextHop) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for NextHop {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

// ===== impl RibUnicastEntry =====

impl RibUnicastEntry {
    // Strips the selection metadata, leaving the programmable route.
    pub fn to_plain(&self) -> UnicastRoute {
        UnicastRoute::new(self.prefix, self.nexthops.clone())
    }
}

// ===== impl RibMplsEntry =====

impl RibMplsEntry {
    pub fn to_plain(&self) -> MplsRoute {
        MplsRoute::new(self.label, self.nexthops.clone())
    }
}

// ===== impl RouteUpdate =====

impl RouteUpdate {
    pub fn is_empty(&self) -> bool {
        self.unicast_upserts.is_empty()
            && self.unicast_deletions.is_empty()
            && self.mpls_upserts.is_empty()
            && self.mpls_deletions.is_empty()
    }

    // Appends a perf mark to the update's trace, if one is being carried.
    pub fn perf_mark(&mut self, node: &str, event: &str) {
        if let Some(perf_events) = &mut self.perf_events {
            perf_events
                .events
                .push(PerfEvent::new(node.to_owned(), event.to_owned(), Utc::now()));
        }
    }
}
