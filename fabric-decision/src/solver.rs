//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use fabric_utils::config::DecisionConfig;
use fabric_utils::mpls::{Label, MplsAction};
use fabric_utils::rib::{
    BgpAttrs, ForwardingAlgorithm, ForwardingType, NextHop, NodeAndArea,
    PrefixEntry, PrefixEntryFlags, RibMplsEntry, RibUnicastEntry,
};
use ipnetwork::IpNetwork;
use tracing::debug;

use crate::error::Error;
use crate::label::PrependLabelAllocator;
use crate::link_state::{Adjacency, LinkState};
use crate::policy::{self, SrPolicy};
use crate::prefix_state::{PrefixEntries, PrefixState};
use crate::route::DecisionRouteDb;

// Comparator applied to BGP announcements tied on preferences and IGP
// distance. The attribute fields are opaque to the rest of the engine.
pub type BgpTieBreaker =
    Box<dyn Fn(&BgpAttrs, &BgpAttrs) -> Ordering + Send + Sync>;

// Outcome of best-path selection for one prefix.
//
// `best` is always a member of `all`, and `all` is never empty.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteSelectionResult {
    pub best: NodeAndArea,
    pub all: BTreeSet<NodeAndArea>,
}

// Computes shortest-path routes from link and prefix state.
pub struct SpfSolver {
    my_node_name: String,
    enable_v4: bool,
    enable_node_segment_label: bool,
    enable_adjacency_labels: bool,
    enable_bgp_route_programming: bool,
    enable_best_route_selection: bool,
    v4_over_v6_nexthop: bool,
    sr_policies: Vec<SrPolicy>,
    // Operator-supplied routes. They bypass selection and shadow dynamic
    // routes for the same key.
    static_unicast_routes: BTreeMap<IpNetwork, RibUnicastEntry>,
    static_mpls_routes: BTreeMap<Label, RibMplsEntry>,
    // Cache of best-route selection: cleared on topology changes, rewritten
    // per prefix whenever a route is computed for it.
    best_routes_cache: BTreeMap<IpNetwork, RouteSelectionResult>,
    // Next-hop set each prepend-labeled prefix is currently bound to.
    prefix_to_nexthop_set: BTreeMap<IpNetwork, BTreeSet<NextHop>>,
    prepend_labels: PrependLabelAllocator,
    bgp_tie_breaker: BgpTieBreaker,
}

// ===== impl RouteSelectionResult =====

impl RouteSelectionResult {
    pub fn has_node(&self, node: &str) -> bool {
        self.all.iter().any(|node_area| node_area.node == node)
    }
}

// ===== impl SpfSolver =====

impl SpfSolver {
    pub fn new(
        my_node_name: String,
        config: &DecisionConfig,
        sr_policies: Vec<SrPolicy>,
    ) -> SpfSolver {
        SpfSolver {
            my_node_name,
            enable_v4: config.enable_v4,
            enable_node_segment_label: config.node_segment_label_enabled,
            enable_adjacency_labels: config.adjacency_labels_enabled,
            enable_bgp_route_programming: config.bgp_route_programming,
            enable_best_route_selection: config.best_route_selection,
            v4_over_v6_nexthop: config.v4_over_v6_nexthop,
            sr_policies,
            static_unicast_routes: Default::default(),
            static_mpls_routes: Default::default(),
            best_routes_cache: Default::default(),
            prefix_to_nexthop_set: Default::default(),
            prepend_labels: Default::default(),
            bgp_tie_breaker: Box::new(default_bgp_tie_breaker),
        }
    }

    // Replaces the comparator used beyond preferences and IGP distance.
    pub fn set_bgp_tie_breaker(&mut self, tie_breaker: BgpTieBreaker) {
        self.bgp_tie_breaker = tie_breaker;
    }

    pub fn update_static_unicast_routes(
        &mut self,
        upserts: BTreeMap<IpNetwork, RibUnicastEntry>,
        deletions: Vec<IpNetwork>,
    ) {
        for (prefix, entry) in upserts {
            if self.static_unicast_routes.get(&prefix) == Some(&entry) {
                Error::DuplicateStaticRoute(prefix).log();
                continue;
            }
            self.static_unicast_routes.insert(prefix, entry);
        }
        for prefix in deletions {
            self.static_unicast_routes.remove(&prefix);
        }
    }

    pub fn update_static_mpls_routes(
        &mut self,
        upserts: BTreeMap<Label, RibMplsEntry>,
        deletions: Vec<Label>,
    ) {
        for (label, entry) in upserts {
            if self.static_mpls_routes.get(&label) == Some(&entry) {
                Error::DuplicateLabelRoute(label).log();
                continue;
            }
            self.static_mpls_routes.insert(label, entry);
        }
        for label in deletions {
            self.static_mpls_routes.remove(&label);
        }
    }

    // Stable read handle for observers. The component publishes snapshots of
    // this map; it is rewritten per prefix and cleared on topology changes.
    pub fn best_routes_cache(
        &self,
    ) -> &BTreeMap<IpNetwork, RouteSelectionResult> {
        &self.best_routes_cache
    }

    pub fn clear_best_routes_cache(&mut self) {
        self.best_routes_cache.clear();
    }

    // Full route database computation.
    //
    // Returns `None` when this node is absent from every area's topology,
    // meaning there is nothing to source SPF from yet.
    pub fn build_route_db(
        &mut self,
        area_link_states: &BTreeMap<String, LinkState>,
        prefix_state: &PrefixState,
    ) -> Option<DecisionRouteDb> {
        if !area_link_states
            .values()
            .any(|link_state| link_state.contains_node(&self.my_node_name))
        {
            return None;
        }

        let mut db = DecisionRouteDb::default();

        // Unicast routes. Statics shadow whatever selection would produce.
        for (prefix, entries) in prefix_state.prefixes() {
            if self.static_unicast_routes.contains_key(prefix) {
                continue;
            }
            if let Some(entry) =
                self.create_route_for_prefix(prefix, entries, area_link_states)
            {
                db.add_unicast_route(entry);
            }
        }
        for entry in self.static_unicast_routes.values() {
            db.add_unicast_route(entry.clone());
        }

        // MPLS routes. Statics first so they shadow dynamic labels.
        for entry in self.static_mpls_routes.values() {
            db.add_mpls_route(entry.clone());
        }
        if self.enable_node_segment_label {
            self.build_node_label_routes(area_link_states, &mut db);
        }
        if self.enable_adjacency_labels {
            self.build_adjacency_label_routes(area_link_states, &mut db);
        }

        // Release prepend labels of prefixes that fell out of the database.
        let stale = self
            .prefix_to_nexthop_set
            .keys()
            .filter(|prefix| !db.unicast.contains_key(prefix))
            .copied()
            .collect::<Vec<_>>();
        for prefix in stale {
            self.update_prepend_label(&prefix, None).ok();
        }

        Some(db)
    }

    // Single-prefix computation for incremental prefix events. A static
    // route for the prefix is returned unchanged.
    pub fn create_route_for_prefix_or_get_static_route(
        &mut self,
        prefix: &IpNetwork,
        area_link_states: &BTreeMap<String, LinkState>,
        prefix_state: &PrefixState,
    ) -> Option<RibUnicastEntry> {
        if let Some(entry) = self.static_unicast_routes.get(prefix) {
            return Some(entry.clone());
        }
        let Some(entries) = prefix_state.entries(prefix).cloned() else {
            // Fully withdrawn prefix: drop whatever state it left behind.
            self.update_prepend_label(prefix, None).ok();
            self.best_routes_cache.remove(prefix);
            return None;
        };
        self.create_route_for_prefix(prefix, &entries, area_link_states)
    }

    // Selection and forwarding computation for one prefix.
    fn create_route_for_prefix(
        &mut self,
        prefix: &IpNetwork,
        prefix_entries: &PrefixEntries,
        area_link_states: &BTreeMap<String, LinkState>,
    ) -> Option<RibUnicastEntry> {
        // Drop v4 prefixes when v4 programming is disabled.
        if prefix.is_ipv4() && !self.enable_v4 {
            debug!(%prefix, "dropping v4 prefix, v4 is disabled");
            return None;
        }

        // Drop announcements from areas or nodes missing in the topology.
        let entries: PrefixEntries = prefix_entries
            .iter()
            .filter(|(node_area, _)| {
                let Some(link_state) = area_link_states.get(&node_area.area)
                else {
                    Error::UnknownArea(node_area.area.clone()).log();
                    return false;
                };
                if !link_state.contains_node(&node_area.node) {
                    Error::AnnouncementFromUnknownNode(
                        node_area.node.clone(),
                        node_area.area.clone(),
                    )
                    .log();
                    return false;
                }
                true
            })
            .map(|(node_area, entry)| (node_area.clone(), entry.clone()))
            .collect();
        if entries.is_empty() {
            self.update_prepend_label(prefix, None).ok();
            return None;
        }

        let has_bgp = entries
            .values()
            .any(|entry| entry.flags.contains(PrefixEntryFlags::BGP));
        if has_bgp && !self.enable_bgp_route_programming {
            debug!(%prefix, "skipping BGP prefix, programming is disabled");
            return None;
        }

        // Best-path selection followed by drain filtering.
        let selection = if has_bgp {
            self.run_best_path_selection_bgp(&entries, area_link_states)
        } else {
            self.select_best_routes(&entries, area_link_states)
        };
        let Some(selection) = selection else {
            self.update_prepend_label(prefix, None).ok();
            self.best_routes_cache.remove(prefix);
            return None;
        };
        let selection =
            self.maybe_filter_drained_nodes(selection, area_link_states);
        self.best_routes_cache.insert(*prefix, selection.clone());

        // Prefixes we announce ourselves are local; nothing to program.
        if selection.has_node(&self.my_node_name) {
            self.update_prepend_label(prefix, None).ok();
            return None;
        }

        let rules = policy::get_route_computation_rules(
            &self.sr_policies,
            prefix,
            &entries,
            &selection,
        );
        let best_entry = entries.get(&selection.best)?.clone();
        let algorithm = rules
            .forwarding_algorithm
            .unwrap_or(best_entry.forwarding_algorithm);

        // Forwarding computation.
        let nexthops = match algorithm {
            ForwardingAlgorithm::SpEcmp => self.select_best_paths_spf(
                prefix,
                &selection,
                best_entry.as_ref(),
                area_link_states,
            ),
            ForwardingAlgorithm::Ksp2EdEcmp => self.select_best_paths_ksp2(
                prefix,
                &selection,
                best_entry.as_ref(),
                area_link_states,
            ),
        };
        if nexthops.is_empty() {
            self.update_prepend_label(prefix, None).ok();
            return None;
        }

        // Drop the route if it cannot satisfy the minimum next-hop count.
        let min_nexthops = selection
            .all
            .iter()
            .filter_map(|node_area| entries.get(node_area))
            .filter_map(|entry| entry.min_nexthops)
            .min();
        if let Some(min_nexthops) = min_nexthops {
            if nexthops.len() < min_nexthops {
                debug!(%prefix, %min_nexthops, "dropping route below min-nexthop threshold");
                self.update_prepend_label(prefix, None).ok();
                return None;
            }
        }

        // Optional prepend label, keyed by the canonical next-hop set.
        let nexthops = if rules.prepend_label {
            let label = match self.update_prepend_label(prefix, Some(&nexthops))
            {
                Ok(label) => label,
                Err(error) => {
                    error.log();
                    return None;
                }
            };
            nexthops
                .into_iter()
                .map(|mut nexthop| {
                    if let Some(label) = label {
                        nexthop.mpls_action = Some(MplsAction::prepend(
                            nexthop.mpls_action.take(),
                            label,
                        ));
                    }
                    nexthop
                })
                .collect()
        } else {
            self.update_prepend_label(prefix, None).ok();
            nexthops
        };

        let do_not_install = best_entry
            .flags
            .contains(PrefixEntryFlags::DO_NOT_INSTALL);
        Some(RibUnicastEntry::new(
            *prefix,
            nexthops,
            (*best_entry).clone(),
            selection.best.clone(),
            do_not_install,
        ))
    }

    // Metric-vector selection: higher path preference, then higher source
    // preference, then lower IGP distance. With best-route selection
    // disabled only the distance is considered.
    fn select_best_routes(
        &self,
        entries: &PrefixEntries,
        area_link_states: &BTreeMap<String, LinkState>,
    ) -> Option<RouteSelectionResult> {
        self.select_by(entries, area_link_states, |a, b| {
            let (a_entry, a_distance) = a;
            let (b_entry, b_distance) = b;
            if self.enable_best_route_selection {
                a_entry
                    .metrics
                    .path_preference
                    .cmp(&b_entry.metrics.path_preference)
                    .then_with(|| {
                        a_entry
                            .metrics
                            .source_preference
                            .cmp(&b_entry.metrics.source_preference)
                    })
                    .then_with(|| b_distance.cmp(&a_distance))
            } else {
                b_distance.cmp(&a_distance)
            }
        })
    }

    // BGP best-path selection. Preferences and IGP distance come first, the
    // remaining attributes are compared by the pluggable tie-breaker.
    fn run_best_path_selection_bgp(
        &self,
        entries: &PrefixEntries,
        area_link_states: &BTreeMap<String, LinkState>,
    ) -> Option<RouteSelectionResult> {
        self.select_by(entries, area_link_states, |a, b| {
            let (a_entry, a_distance) = a;
            let (b_entry, b_distance) = b;
            a_entry
                .metrics
                .path_preference
                .cmp(&b_entry.metrics.path_preference)
                .then_with(|| {
                    a_entry
                        .metrics
                        .source_preference
                        .cmp(&b_entry.metrics.source_preference)
                })
                .then_with(|| b_distance.cmp(&a_distance))
                .then_with(|| {
                    match (&a_entry.bgp_attrs, &b_entry.bgp_attrs) {
                        (Some(a_attrs), Some(b_attrs)) => {
                            (self.bgp_tie_breaker)(a_attrs, b_attrs)
                        }
                        (Some(_), None) => Ordering::Greater,
                        (None, Some(_)) => Ordering::Less,
                        (None, None) => Ordering::Equal,
                    }
                })
        })
    }

    // Shared selection loop: reachable announcements are folded under the
    // given comparator, ties accumulate into an equal-cost set.
    fn select_by<F>(
        &self,
        entries: &PrefixEntries,
        area_link_states: &BTreeMap<String, LinkState>,
        compare: F,
    ) -> Option<RouteSelectionResult>
    where
        F: Fn((&PrefixEntry, u32), (&PrefixEntry, u32)) -> Ordering,
    {
        let mut best: Option<(NodeAndArea, (PrefixEntry, u32))> = None;
        let mut all = BTreeSet::new();

        for (node_area, entry) in entries {
            // IGP distance from this node to the announcing node, in the
            // announcement's area. Unreachable announcements are skipped.
            let Some(link_state) = area_link_states.get(&node_area.area)
            else {
                continue;
            };
            let spf = link_state.spf(&self.my_node_name);
            let Some(distance) = spf.metric(&node_area.node) else {
                continue;
            };

            let ordering = match &best {
                None => Ordering::Greater,
                Some((_, (best_entry, best_distance))) => compare(
                    (entry.as_ref(), distance),
                    (best_entry, *best_distance),
                ),
            };
            match ordering {
                Ordering::Greater => {
                    best = Some((
                        node_area.clone(),
                        ((**entry).clone(), distance),
                    ));
                    all = BTreeSet::new();
                    all.insert(node_area.clone());
                }
                Ordering::Equal => {
                    all.insert(node_area.clone());
                }
                Ordering::Less => (),
            }
        }

        let (best, _) = best?;
        Some(RouteSelectionResult { best, all })
    }

    // Removes overloaded announcing nodes from the selection, unless the
    // filter would leave nothing behind, in which case it is skipped.
    fn maybe_filter_drained_nodes(
        &self,
        selection: RouteSelectionResult,
        area_link_states: &BTreeMap<String, LinkState>,
    ) -> RouteSelectionResult {
        let filtered: BTreeSet<_> = selection
            .all
            .iter()
            .filter(|node_area| {
                !area_link_states
                    .get(&node_area.area)
                    .is_some_and(|ls| ls.is_node_overloaded(&node_area.node))
            })
            .cloned()
            .collect();
        if filtered.is_empty() {
            return selection;
        }

        let best = if filtered.contains(&selection.best) {
            selection.best
        } else {
            filtered.first().cloned().unwrap()
        };
        RouteSelectionResult {
            best,
            all: filtered,
        }
    }

    // SP-ECMP: all first hops lying on some shortest path toward the
    // minimum-cost selected nodes, per area.
    fn select_best_paths_spf(
        &self,
        prefix: &IpNetwork,
        selection: &RouteSelectionResult,
        best_entry: &PrefixEntry,
        area_link_states: &BTreeMap<String, LinkState>,
    ) -> BTreeSet<NextHop> {
        let push_labels = best_entry.forwarding_type == ForwardingType::SrMpls
            && self.enable_node_segment_label;

        let mut nexthops = BTreeSet::new();
        for (area, dsts) in group_by_area(&selection.all) {
            let Some(link_state) = area_link_states.get(area) else {
                continue;
            };
            nexthops.extend(self.area_next_hops(
                link_state,
                &dsts,
                prefix.is_ipv4(),
                push_labels,
                None,
                false,
            ));
        }
        nexthops
    }

    // KSP2-ED-ECMP: union of the shortest paths' first hops and the first
    // hops of the second-shortest edge-disjoint path, computed per area by
    // removing each shortest-path link in turn and re-running SPF. Weights
    // and metrics on alternate next-hops reflect the alternate path.
    fn select_best_paths_ksp2(
        &self,
        prefix: &IpNetwork,
        selection: &RouteSelectionResult,
        best_entry: &PrefixEntry,
        area_link_states: &BTreeMap<String, LinkState>,
    ) -> BTreeSet<NextHop> {
        let is_v4 = prefix.is_ipv4();
        let push_labels = best_entry.forwarding_type == ForwardingType::SrMpls
            && self.enable_node_segment_label;

        let mut nexthops = BTreeSet::new();
        for (area, dsts) in group_by_area(&selection.all) {
            let Some(link_state) = area_link_states.get(area) else {
                continue;
            };

            // Shortest paths.
            nexthops.extend(self.area_next_hops(
                link_state,
                &dsts,
                is_v4,
                push_labels,
                None,
                true,
            ));

            // Second-shortest edge-disjoint paths, per destination.
            let spf = link_state.spf(&self.my_node_name);
            for node_area in &dsts {
                if spf.metric(&node_area.node).is_none() {
                    continue;
                }
                let links = spf
                    .shortest_path_links(&self.my_node_name, &node_area.node);

                let mut alt_metric = None;
                let mut alt_results = Vec::new();
                for link in &links {
                    let ignored = std::iter::once(link.clone()).collect();
                    let alt =
                        link_state.spf_ignoring(&self.my_node_name, &ignored);
                    let Some(metric) = alt.metric(&node_area.node) else {
                        continue;
                    };
                    match alt_metric {
                        Some(best) if metric > best => (),
                        Some(best) if metric == best => alt_results.push(alt),
                        _ => {
                            alt_metric = Some(metric);
                            alt_results = vec![alt];
                        }
                    }
                }

                for alt in &alt_results {
                    let Some(vertex) = alt.get(&node_area.node) else {
                        continue;
                    };
                    for link in &vertex.first_hops {
                        let Some(adj) = link_state.adjacency(link) else {
                            continue;
                        };
                        if let Some(nexthop) = self.make_next_hop(
                            link_state,
                            adj,
                            node_area,
                            is_v4,
                            push_labels,
                            None,
                            vertex.metric,
                            vertex.metric,
                        ) {
                            nexthops.insert(nexthop);
                        }
                    }
                }
            }
        }
        nexthops
    }

    // First hops toward the minimum-cost subset of `dsts` within one area.
    fn area_next_hops(
        &self,
        link_state: &LinkState,
        dsts: &BTreeSet<NodeAndArea>,
        is_v4: bool,
        push_labels: bool,
        swap_label: Option<Label>,
        weight_from_metric: bool,
    ) -> BTreeSet<NextHop> {
        let spf = link_state.spf(&self.my_node_name);
        let Some(min_metric) = dsts
            .iter()
            .filter_map(|node_area| spf.metric(&node_area.node))
            .min()
        else {
            return BTreeSet::new();
        };

        let mut nexthops = BTreeSet::new();
        for node_area in dsts {
            let Some(vertex) = spf.get(&node_area.node) else {
                continue;
            };
            if vertex.metric != min_metric {
                continue;
            }
            for link in &vertex.first_hops {
                let Some(adj) = link_state.adjacency(link) else {
                    continue;
                };
                let weight =
                    if weight_from_metric { vertex.metric } else { 0 };
                if let Some(nexthop) = self.make_next_hop(
                    link_state,
                    adj,
                    node_area,
                    is_v4,
                    push_labels,
                    swap_label,
                    vertex.metric,
                    weight,
                ) {
                    nexthops.insert(nexthop);
                }
            }
        }
        nexthops
    }

    // Builds one next-hop, attaching the MPLS action the forwarding type
    // calls for: SWAP (or PHP on the penultimate hop) for label routes, PUSH
    // of the destination's node segment label (nothing on the penultimate
    // hop) for SR-MPLS unicast routes.
    #[allow(clippy::too_many_arguments)]
    fn make_next_hop(
        &self,
        link_state: &LinkState,
        adj: &Adjacency,
        dst: &NodeAndArea,
        is_v4: bool,
        push_labels: bool,
        swap_label: Option<Label>,
        metric: u32,
        weight: u32,
    ) -> Option<NextHop> {
        let addr = if is_v4 && !self.v4_over_v6_nexthop {
            adj.nexthop_v4?
        } else {
            adj.nexthop_v6
        };

        let mpls_action = if let Some(label) = swap_label {
            if adj.neighbor == dst.node {
                Some(MplsAction::Php)
            } else {
                Some(MplsAction::Swap(label))
            }
        } else if push_labels && adj.neighbor != dst.node {
            link_state
                .node_label(&dst.node)
                .map(|label| MplsAction::Push(vec![label]))
        } else {
            None
        };

        Some(NextHop::new(
            addr,
            adj.ifname.clone(),
            weight,
            mpls_action,
            metric,
        ))
    }

    // Installs one label route per remote node carrying a segment label:
    // SWAP toward the destination, PHP on the penultimate hop.
    fn build_node_label_routes(
        &mut self,
        area_link_states: &BTreeMap<String, LinkState>,
        db: &mut DecisionRouteDb,
    ) {
        for (area, link_state) in area_link_states {
            let nodes = link_state
                .nodes()
                .map(|node_db| (node_db.node.clone(), node_db.node_label))
                .collect::<Vec<_>>();
            for (node, node_label) in nodes {
                if node == self.my_node_name {
                    continue;
                }
                let Some(label) = node_label else {
                    continue;
                };
                if self.static_mpls_routes.contains_key(&label) {
                    // Shadowed by a static route.
                    continue;
                }
                if db.mpls.contains_key(&label) {
                    Error::DuplicateLabelRoute(label).log();
                    continue;
                }

                let dsts = std::iter::once(NodeAndArea::new(
                    node.clone(),
                    area.clone(),
                ))
                .collect();
                let nexthops = self.area_next_hops(
                    link_state,
                    &dsts,
                    false,
                    false,
                    Some(label),
                    false,
                );
                if nexthops.is_empty() {
                    continue;
                }
                db.add_mpls_route(RibMplsEntry::new(label, nexthops));
            }
        }
    }

    // Installs one POP route per local adjacency label, pointing at the
    // specific neighbor.
    fn build_adjacency_label_routes(
        &mut self,
        area_link_states: &BTreeMap<String, LinkState>,
        db: &mut DecisionRouteDb,
    ) {
        for link_state in area_link_states.values() {
            for adj in link_state.adjacencies_from(&self.my_node_name) {
                let Some(label) = adj.adj_label else {
                    continue;
                };
                if self.static_mpls_routes.contains_key(&label) {
                    continue;
                }
                if db.mpls.contains_key(&label) {
                    Error::DuplicateLabelRoute(label).log();
                    continue;
                }

                let nexthop = NextHop::new(
                    adj.nexthop_v6,
                    adj.ifname.clone(),
                    0,
                    Some(MplsAction::Pop),
                    adj.metric,
                );
                db.add_mpls_route(RibMplsEntry::new(
                    label,
                    std::iter::once(nexthop).collect(),
                ));
            }
        }
    }

    // Keeps the prefix's prepend-label binding in sync with its next-hop
    // set, acquiring before releasing so unchanged sets keep their label.
    fn update_prepend_label(
        &mut self,
        prefix: &IpNetwork,
        nexthops: Option<&BTreeSet<NextHop>>,
    ) -> Result<Option<Label>, Error> {
        let old = self.prefix_to_nexthop_set.get(prefix);
        match (old, nexthops) {
            (Some(old), Some(new)) if old == new => {
                Ok(self.prepend_labels.lookup(new))
            }
            (_, Some(new)) => {
                let label = self
                    .prepend_labels
                    .acquire(new)
                    .ok_or(Error::PrependLabelExhausted(*prefix))?;
                if let Some(old) = self.prefix_to_nexthop_set.remove(prefix) {
                    self.prepend_labels.release(&old);
                }
                self.prefix_to_nexthop_set.insert(*prefix, new.clone());
                Ok(Some(label))
            }
            (Some(_), None) => {
                let old = self.prefix_to_nexthop_set.remove(prefix).unwrap();
                self.prepend_labels.release(&old);
                Ok(None)
            }
            (None, None) => Ok(None),
        }
    }
}

// ===== helper functions =====

// Groups selected (node, area) pairs by area.
fn group_by_area(
    node_areas: &BTreeSet<NodeAndArea>,
) -> BTreeMap<&str, BTreeSet<NodeAndArea>> {
    let mut groups: BTreeMap<&str, BTreeSet<NodeAndArea>> = BTreeMap::new();
    for node_area in node_areas {
        groups
            .entry(node_area.area.as_str())
            .or_default()
            .insert(node_area.clone());
    }
    groups
}

// Default comparator over the opaque BGP attributes: shorter AS path, lower
// origin, lower MED, shorter cluster list, lower originator id.
fn default_bgp_tie_breaker(a: &BgpAttrs, b: &BgpAttrs) -> Ordering {
    (
        b.as_path_len,
        b.origin,
        b.med,
        b.cluster_list_len,
        b.originator_id,
    )
        .cmp(&(
            a.as_path_len,
            a.origin,
            a.med,
            a.cluster_list_len,
            a.originator_id,
        ))
}
