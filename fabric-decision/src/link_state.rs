//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use derive_new::new;
use fabric_utils::mpls::Label;
use serde::{Deserialize, Serialize};

pub type NodeName = String;

// Directed link identifier: the reporting node plus its local interface.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct LinkId {
    pub node: NodeName,
    pub ifname: String,
}

// One directed adjacency as reported by a node.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Adjacency {
    pub neighbor: NodeName,
    pub ifname: String,
    pub remote_ifname: String,
    pub metric: u32,
    pub nexthop_v4: Option<IpAddr>,
    pub nexthop_v6: IpAddr,
    pub adj_label: Option<Label>,
    // Drained link: excluded from path computation entirely.
    pub overloaded: bool,
}

// Full adjacency report of one node within an area.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct AdjacencyDatabase {
    pub node: NodeName,
    // Overloaded nodes are avoided as transit but remain reachable as
    // destinations.
    pub overloaded: bool,
    pub node_label: Option<Label>,
    pub adjacencies: Vec<Adjacency>,
}

// Per-area link-state graph.
//
// Owns one adjacency database per node. SPF results are memoized per source
// node; the cache is dropped on every mutation. The cache uses interior
// mutability because all access happens from the decision engine's
// single-threaded event loop.
#[derive(Debug, Default)]
pub struct LinkState {
    nodes: BTreeMap<NodeName, AdjacencyDatabase>,
    spf_cache: RefCell<BTreeMap<NodeName, Arc<SpfResult>>>,
}

// Shortest-path tree rooted at one node.
#[derive(Clone, Debug, Default)]
pub struct SpfResult {
    vertices: BTreeMap<NodeName, SpfVertex>,
}

#[derive(Clone, Debug, new)]
pub struct SpfVertex {
    pub metric: u32,
    // Adjacencies of the SPF root lying on some shortest path to this
    // vertex.
    pub first_hops: BTreeSet<LinkId>,
    // Incoming links on some shortest path into this vertex.
    pub pred_links: BTreeSet<LinkId>,
}

// ===== impl LinkState =====

impl LinkState {
    // Installs or replaces a node's adjacency database. Returns whether the
    // topology changed.
    pub fn update(&mut self, db: AdjacencyDatabase) -> bool {
        if self.nodes.get(&db.node) == Some(&db) {
            return false;
        }
        self.nodes.insert(db.node.clone(), db);
        self.spf_cache.borrow_mut().clear();
        true
    }

    // Removes a node from the graph. Returns whether it was present.
    pub fn remove_node(&mut self, node: &str) -> bool {
        let removed = self.nodes.remove(node).is_some();
        if removed {
            self.spf_cache.borrow_mut().clear();
        }
        removed
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn is_node_overloaded(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(|db| db.overloaded)
    }

    pub fn node_label(&self, node: &str) -> Option<Label> {
        self.nodes.get(node).and_then(|db| db.node_label)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &AdjacencyDatabase> {
        self.nodes.values()
    }

    // Resolves a directed link to the adjacency that reported it.
    pub fn adjacency(&self, link: &LinkId) -> Option<&Adjacency> {
        self.nodes.get(&link.node).and_then(|db| {
            db.adjacencies.iter().find(|adj| adj.ifname == link.ifname)
        })
    }

    pub fn adjacencies_from(
        &self,
        node: &str,
    ) -> impl Iterator<Item = &Adjacency> {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|db| db.adjacencies.iter())
    }

    // Computes (or fetches from cache) the shortest-path tree rooted at
    // `src`.
    pub fn spf(&self, src: &str) -> Arc<SpfResult> {
        if let Some(result) = self.spf_cache.borrow().get(src) {
            return result.clone();
        }
        let result = Arc::new(self.run_spf(src, &BTreeSet::new()));
        self.spf_cache
            .borrow_mut()
            .insert(src.to_owned(), result.clone());
        result
    }

    // Computes a shortest-path tree with the given links excluded. Used for
    // alternate-path computation; never cached.
    pub fn spf_ignoring(
        &self,
        src: &str,
        ignored_links: &BTreeSet<LinkId>,
    ) -> SpfResult {
        self.run_spf(src, ignored_links)
    }

    // Dijkstra over the adjacency databases.
    //
    // Links are traversed only when both endpoints report them (mutual link
    // check) and neither direction is drained or excluded. Overloaded nodes
    // are added to the tree but their links are not expanded, so they can
    // terminate paths without carrying transit. First-hop sets are seeded at
    // the root's own adjacencies and inherited downstream, which yields all
    // equal-cost first hops without retracing paths.
    fn run_spf(
        &self,
        src: &str,
        ignored_links: &BTreeSet<LinkId>,
    ) -> SpfResult {
        let mut spt = BTreeMap::new();
        let mut cand_list = BTreeMap::new();
        cand_list.insert(
            (0, src.to_owned()),
            SpfVertex::new(0, Default::default(), Default::default()),
        );

        while let Some(((_, node), vertex)) = cand_list.pop_first() {
            let vertex = match spt.entry(node.clone()) {
                std::collections::btree_map::Entry::Vacant(v) => {
                    v.insert(vertex)
                }
                std::collections::btree_map::Entry::Occupied(_) => continue,
            };
            let vertex = vertex.clone();

            if node != src && self.is_node_overloaded(&node) {
                continue;
            }

            for adj in self.adjacencies_from(&node) {
                if adj.overloaded {
                    continue;
                }
                let fwd = LinkId::new(node.clone(), adj.ifname.clone());
                let rev = LinkId::new(
                    adj.neighbor.clone(),
                    adj.remote_ifname.clone(),
                );
                if ignored_links.contains(&fwd)
                    || ignored_links.contains(&rev)
                {
                    continue;
                }

                // Check if the databases are mutually linked.
                let Some(rev_adj) = self.adjacency(&rev) else {
                    continue;
                };
                if rev_adj.neighbor != node || rev_adj.overloaded {
                    continue;
                }

                // Check if the neighbor is already on the shortest-path
                // tree.
                if spt.contains_key(&adj.neighbor) {
                    continue;
                }

                // Calculate distance to the neighbor.
                let distance = vertex.metric.saturating_add(adj.metric);

                // First hops: the adjacency itself at the root, inherited
                // otherwise.
                let first_hops = if node == src {
                    std::iter::once(fwd.clone()).collect()
                } else {
                    vertex.first_hops.clone()
                };

                // Check if this vertex is already present on the candidate
                // list.
                if let Some((cand_key, _)) = cand_list
                    .iter()
                    .find(|((_, cand_name), _)| *cand_name == adj.neighbor)
                {
                    match distance.cmp(&cand_key.0) {
                        Ordering::Less => {
                            // Remove vertex since its key has changed. It
                            // will be re-added with the correct key below.
                            let cand_key = cand_key.clone();
                            cand_list.remove(&cand_key);
                        }
                        Ordering::Equal => {}
                        Ordering::Greater => {
                            // Ignore higher cost path.
                            continue;
                        }
                    }
                }
                let cand_v = cand_list
                    .entry((distance, adj.neighbor.clone()))
                    .or_insert_with(|| {
                        SpfVertex::new(
                            distance,
                            Default::default(),
                            Default::default(),
                        )
                    });
                cand_v.first_hops.extend(first_hops);
                cand_v.pred_links.insert(fwd);
            }
        }

        SpfResult { vertices: spt }
    }
}

// ===== impl SpfResult =====

impl SpfResult {
    pub fn get(&self, node: &str) -> Option<&SpfVertex> {
        self.vertices.get(node)
    }

    pub fn metric(&self, node: &str) -> Option<u32> {
        self.vertices.get(node).map(|vertex| vertex.metric)
    }

    pub fn vertices(&self) -> impl Iterator<Item = (&NodeName, &SpfVertex)> {
        self.vertices.iter()
    }

    // Collects every link lying on some shortest path from the tree's root
    // to `dst` by walking the predecessor links backwards.
    pub fn shortest_path_links(&self, src: &str, dst: &str) -> BTreeSet<LinkId> {
        let mut links = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut queue = vec![dst.to_owned()];
        while let Some(node) = queue.pop() {
            if node == src || !visited.insert(node.clone()) {
                continue;
            }
            let Some(vertex) = self.vertices.get(&node) else {
                continue;
            };
            for link in &vertex.pred_links {
                links.insert(link.clone());
                queue.push(link.node.clone());
            }
        }
        links
    }
}
