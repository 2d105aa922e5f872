//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod error;
pub mod label;
pub mod link_state;
pub mod policy;
pub mod prefix_state;
pub mod route;
pub mod solver;

use std::collections::{BTreeMap, BTreeSet};

use fabric_utils::config::DecisionConfig;
use fabric_utils::kv::Publication;
use fabric_utils::rib::{NodeAndArea, RouteUpdate};
use fabric_utils::task::Task;
use fabric_utils::watchdog::Heartbeat;
use fabric_utils::{Responder, UnboundedReceiver, UnboundedSender};
use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::link_state::{AdjacencyDatabase, LinkState};
use crate::prefix_state::{PrefixDatabase, PrefixState};
use crate::route::DecisionRouteDb;
use crate::solver::{RouteSelectionResult, SpfSolver};

// Store key prefixes the engine subscribes to.
pub const KEY_PREFIX_ADJ: &str = "adj:";
pub const KEY_PREFIX_PREFIX: &str = "prefix:";

// Introspection requests served by the component.
#[derive(Debug)]
enum Command {
    GetRouteDb(Responder<DecisionRouteDb>),
    GetBestRoutes(Responder<BTreeMap<IpNetwork, RouteSelectionResult>>),
    Stop,
}

// Client-side handle to a running decision component.
#[derive(Clone, Debug)]
pub struct DecisionHandle {
    cmd_tx: UnboundedSender<Command>,
    heartbeat: Heartbeat,
}

// The decision component: consumes link-state and prefix advertisements
// from the store's publication stream plus operator static routes, and
// publishes route-database deltas toward the FIB programmer.
pub struct Decision {
    my_node_name: String,
    solver: SpfSolver,
    area_link_states: BTreeMap<String, LinkState>,
    prefix_state: PrefixState,
    route_db: DecisionRouteDb,
    route_updates_tx: UnboundedSender<RouteUpdate>,
    // The very first computation is always published, even when empty, so
    // downstream consumers can tell replay has ended.
    sent_initial_update: bool,
    heartbeat: Heartbeat,
}

// ===== impl DecisionHandle =====

impl DecisionHandle {
    // Returns a copy of the engine's current route database.
    pub async fn get_route_db(&self) -> Option<DecisionRouteDb> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetRouteDb(responder)).ok()?;
        rx.await.ok()
    }

    // Returns a snapshot of the best-routes cache.
    pub async fn get_best_routes(
        &self,
    ) -> Option<BTreeMap<IpNetwork, RouteSelectionResult>> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetBestRoutes(responder)).ok()?;
        rx.await.ok()
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }
}

// ===== impl Decision =====

impl Decision {
    // Starts the component. The returned task owns the event loop; dropping
    // it cancels the component.
    pub fn spawn(
        my_node_name: String,
        config: &DecisionConfig,
        sr_policies: Vec<policy::SrPolicy>,
        publications_rx: UnboundedReceiver<Publication>,
        static_routes_rx: UnboundedReceiver<RouteUpdate>,
        route_updates_tx: UnboundedSender<RouteUpdate>,
    ) -> (DecisionHandle, Task<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let heartbeat = Heartbeat::new();

        let decision = Decision {
            solver: SpfSolver::new(my_node_name.clone(), config, sr_policies),
            my_node_name,
            area_link_states: Default::default(),
            prefix_state: Default::default(),
            route_db: Default::default(),
            route_updates_tx,
            sent_initial_update: false,
            heartbeat: heartbeat.clone(),
        };

        let handle = DecisionHandle { cmd_tx, heartbeat };
        let task = Task::spawn(decision.run(
            publications_rx,
            static_routes_rx,
            cmd_rx,
        ));
        (handle, task)
    }

    async fn run(
        mut self,
        mut publications_rx: UnboundedReceiver<Publication>,
        mut static_routes_rx: UnboundedReceiver<RouteUpdate>,
        mut cmd_rx: UnboundedReceiver<Command>,
    ) {
        info!("starting decision engine");

        loop {
            tokio::select! {
                publication = publications_rx.recv() => {
                    let Some(publication) = publication else { break };
                    // Coalesce whatever else is already queued into one
                    // computation round.
                    let mut batch = vec![publication];
                    while let Ok(publication) = publications_rx.try_recv() {
                        batch.push(publication);
                    }
                    self.process_publications(batch);
                }
                update = static_routes_rx.recv() => {
                    let Some(update) = update else { break };
                    self.process_static_routes(update);
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::GetRouteDb(responder)) => {
                            let _ = responder.send(self.route_db.clone());
                        }
                        Some(Command::GetBestRoutes(responder)) => {
                            let _ = responder.send(
                                self.solver.best_routes_cache().clone(),
                            );
                        }
                        Some(Command::Stop) | None => break,
                    }
                }
            }
            self.heartbeat.touch();
        }

        info!("decision engine stopped");
    }

    // Digests a batch of store publications into topology and prefix
    // changes, then recomputes.
    fn process_publications(&mut self, batch: Vec<Publication>) {
        let mut topology_changed = false;
        let mut changed_prefixes = BTreeSet::new();

        for publication in batch {
            let area = publication.area;

            for (key, value) in publication.key_vals {
                // TTL refreshes carry no payload and no state.
                let Some(payload) = &value.payload else { continue };

                if let Some(node) = key.strip_prefix(KEY_PREFIX_ADJ) {
                    match serde_json::from_slice::<AdjacencyDatabase>(payload)
                    {
                        Ok(db) => {
                            if db.node != node {
                                warn!(%key, node = %db.node,
                                    "adjacency database key/node mismatch");
                                continue;
                            }
                            let link_state = self
                                .area_link_states
                                .entry(area.clone())
                                .or_default();
                            if link_state.update(db) {
                                topology_changed = true;
                            }
                        }
                        Err(error) => {
                            Error::PayloadDecodeError(key, error).log();
                        }
                    }
                } else if let Some(node) = key.strip_prefix(KEY_PREFIX_PREFIX)
                {
                    match serde_json::from_slice::<PrefixDatabase>(payload) {
                        Ok(db) => {
                            let node_area = NodeAndArea::new(
                                node.to_owned(),
                                area.clone(),
                            );
                            changed_prefixes.extend(
                                self.prefix_state
                                    .apply_prefix_database(node_area, &db),
                            );
                        }
                        Err(error) => {
                            Error::PayloadDecodeError(key, error).log();
                        }
                    }
                } else {
                    debug!(%key, "ignoring unrelated key");
                }
            }

            for key in publication.expired_keys {
                if let Some(node) = key.strip_prefix(KEY_PREFIX_ADJ) {
                    if let Some(link_state) =
                        self.area_link_states.get_mut(&area)
                    {
                        if link_state.remove_node(node) {
                            topology_changed = true;
                        }
                    }
                } else if let Some(node) = key.strip_prefix(KEY_PREFIX_PREFIX)
                {
                    let node_area =
                        NodeAndArea::new(node.to_owned(), area.clone());
                    changed_prefixes
                        .extend(self.prefix_state.remove_node(&node_area));
                }
            }
        }

        self.recompute(topology_changed, changed_prefixes);
    }

    // Installs operator static routes and recomputes the affected keys.
    fn process_static_routes(&mut self, update: RouteUpdate) {
        let mut changed_prefixes = BTreeSet::new();
        changed_prefixes.extend(update.unicast_upserts.keys().copied());
        changed_prefixes.extend(update.unicast_deletions.iter().copied());
        let mpls_changed = !update.mpls_upserts.is_empty()
            || !update.mpls_deletions.is_empty();

        self.solver.update_static_unicast_routes(
            update.unicast_upserts,
            update.unicast_deletions,
        );
        self.solver.update_static_mpls_routes(
            update.mpls_upserts,
            update.mpls_deletions,
        );

        // Label-table changes need a full pass; unicast statics only touch
        // their own prefixes.
        self.recompute(mpls_changed, changed_prefixes);
    }

    // Recomputes routes and publishes the delta. Topology changes (and the
    // very first round) trigger a full rebuild with an invalidated
    // best-routes cache; prefix-only rounds rewrite just the prefixes that
    // moved.
    fn recompute(
        &mut self,
        topology_changed: bool,
        changed_prefixes: BTreeSet<IpNetwork>,
    ) {
        let update = if topology_changed || !self.sent_initial_update {
            self.solver.clear_best_routes_cache();
            let Some(new_db) = self
                .solver
                .build_route_db(&self.area_link_states, &self.prefix_state)
            else {
                debug!(node = %self.my_node_name,
                    "node not present in any area, skipping computation");
                return;
            };
            let update = self.route_db.calculate_update(&new_db);
            self.route_db = new_db;
            update
        } else {
            let mut update = RouteUpdate::default();
            for prefix in changed_prefixes {
                let new_entry =
                    self.solver.create_route_for_prefix_or_get_static_route(
                        &prefix,
                        &self.area_link_states,
                        &self.prefix_state,
                    );
                match (self.route_db.unicast.get(&prefix), new_entry) {
                    (old, Some(new)) if old != Some(&new) => {
                        update.unicast_upserts.insert(prefix, new);
                    }
                    (Some(_), None) => {
                        update.unicast_deletions.push(prefix);
                    }
                    _ => (),
                }
            }
            self.route_db.update(&update);
            update
        };

        if !update.is_empty() || !self.sent_initial_update {
            if self.route_updates_tx.send(update).is_err() {
                Error::FibQueueClosed.log();
                return;
            }
            self.sent_initial_update = true;
        }
    }
}
