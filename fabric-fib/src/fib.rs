//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fabric_kv::KvStoreClientHandle;
use fabric_utils::agent::{FibAgentService, MplsRoute, UnicastRoute};
use fabric_utils::backoff::ExponentialBackoff;
use fabric_utils::config::FibConfig;
use fabric_utils::ip::IpNetworkExt;
use fabric_utils::kv::TTL_INFINITY;
use fabric_utils::mpls::Label;
use fabric_utils::queue::ReplicateQueue;
use fabric_utils::rib::{
    PerfEvents, RibMplsEntry, RibUnicastEntry, RouteDatabase,
    RouteDatabaseDelta, RouteDatabaseDetail, RouteUpdate,
};
use fabric_utils::task::{Task, sleep_until_opt};
use fabric_utils::watchdog::Heartbeat;
use fabric_utils::{Responder, UnboundedReceiver, UnboundedSender};
use ipnetwork::IpNetwork;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Error;

// Bound on the retained perf traces.
const PERF_DB_MAX_SIZE: usize = 32;
// Area used for the programming timestamp key.
const TIMESTAMP_AREA: &str = "0";

// Counters exposed for introspection. Add/delete counters track routes, not
// RPC calls.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub unicast_routes_added: u64,
    pub unicast_routes_deleted: u64,
    pub mpls_routes_added: u64,
    pub mpls_routes_deleted: u64,
    pub full_syncs: u64,
    pub programming_failures: u64,
    pub keepalive_failures: u64,
}

// Programming lifecycle.
//
// `AwaitingFirstUpdate` suppresses the initial full sync until either the
// first decision publication arrives or the cold-start timer expires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ProgrammingState {
    AwaitingFirstUpdate,
    Syncing,
    Synced,
}

// Requests served by the component.
enum Command {
    GetRouteDb(Responder<RouteDatabase>),
    GetRouteDetailDb(Responder<RouteDatabaseDetail>),
    GetUnicastRoutes(Vec<IpNetwork>, Responder<Vec<UnicastRoute>>),
    GetMplsRoutes(Vec<Label>, Responder<Vec<MplsRoute>>),
    GetPerfDb(Responder<Vec<PerfEvents>>),
    LongestPrefixMatch(IpNetwork, Responder<Option<IpNetwork>>),
    GetCounters(Responder<Counters>),
    SubscribeFib(Responder<UnboundedReceiver<RouteDatabaseDelta>>),
    SubscribeFibDetail(Responder<UnboundedReceiver<RouteUpdate>>),
    Stop,
}

// Routes that actually have to reach the agent after a mirror merge:
// do-not-install entries are filtered out, and entries that turned
// do-not-install are converted into deletions.
#[derive(Debug, Default)]
struct AgentDelta {
    unicast_add: Vec<UnicastRoute>,
    unicast_del: Vec<IpNetwork>,
    mpls_add: Vec<MplsRoute>,
    mpls_del: Vec<Label>,
}

// Client-side handle to a running FIB programmer.
#[derive(Clone)]
pub struct FibHandle {
    cmd_tx: UnboundedSender<Command>,
    heartbeat: Heartbeat,
}

// Keeps the forwarding agent's table equal to the computed route database,
// modulo do-not-install.
pub struct Fib {
    my_node_name: String,
    client_id: i16,
    agent: Arc<dyn FibAgentService>,
    kv: Option<KvStoreClientHandle>,
    // Local mirror of the computed routes, do-not-install included.
    unicast: BTreeMap<IpNetwork, RibUnicastEntry>,
    mpls: BTreeMap<Label, RibMplsEntry>,
    state: ProgrammingState,
    // Set when the previous programming attempt left the agent behind the
    // mirror; forces the next interaction to be a full sync.
    dirty: bool,
    // Last alive-since epoch heard from the agent; zero means never.
    latest_alive_since: i64,
    backoff: ExponentialBackoff,
    sync_deadline: Option<Instant>,
    cold_start_deadline: Option<Instant>,
    keep_alive_interval: Duration,
    // One-slot semaphore so incremental programming and full resync never
    // overlap, even across suspension points.
    update_routes_sem: Arc<Semaphore>,
    perf_db: VecDeque<PerfEvents>,
    counters: Counters,
    fib_subscribers: ReplicateQueue<RouteDatabaseDelta>,
    fib_detail_subscribers: ReplicateQueue<RouteUpdate>,
    heartbeat: Heartbeat,
}

// ===== impl FibHandle =====

impl FibHandle {
    pub async fn get_route_db(&self) -> Result<RouteDatabase, Error> {
        self.request(Command::GetRouteDb).await
    }

    pub async fn get_route_detail_db(
        &self,
    ) -> Result<RouteDatabaseDetail, Error> {
        self.request(Command::GetRouteDetailDb).await
    }

    // Unicast routes covered by any of the given prefixes (all routes when
    // the filter is empty).
    pub async fn get_unicast_routes(
        &self,
        prefixes: Vec<IpNetwork>,
    ) -> Result<Vec<UnicastRoute>, Error> {
        self.request(|responder| Command::GetUnicastRoutes(prefixes, responder))
            .await
    }

    // MPLS routes with the given labels (all routes when the filter is
    // empty).
    pub async fn get_mpls_routes(
        &self,
        labels: Vec<Label>,
    ) -> Result<Vec<MplsRoute>, Error> {
        self.request(|responder| Command::GetMplsRoutes(labels, responder))
            .await
    }

    pub async fn get_perf_db(&self) -> Result<Vec<PerfEvents>, Error> {
        self.request(Command::GetPerfDb).await
    }

    // Most specific mirror prefix covering the queried one, if any.
    pub async fn longest_prefix_match(
        &self,
        prefix: IpNetwork,
    ) -> Result<Option<IpNetwork>, Error> {
        self.request(|responder| Command::LongestPrefixMatch(prefix, responder))
            .await
    }

    pub async fn get_counters(&self) -> Result<Counters, Error> {
        self.request(Command::GetCounters).await
    }

    // Streaming subscription: a synthetic full snapshot followed by deltas,
    // do-not-install entries filtered out.
    pub async fn subscribe_fib(
        &self,
    ) -> Result<UnboundedReceiver<RouteDatabaseDelta>, Error> {
        self.request(Command::SubscribeFib).await
    }

    // Same, enriched with selection metadata.
    pub async fn subscribe_fib_detail(
        &self,
    ) -> Result<UnboundedReceiver<RouteUpdate>, Error> {
        self.request(Command::SubscribeFibDetail).await
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    async fn request<T, F>(&self, make: F) -> Result<T, Error>
    where
        F: FnOnce(Responder<T>) -> Command,
    {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(responder))
            .map_err(|_| Error::FibStopped)?;
        rx.await.map_err(|_| Error::FibStopped)
    }
}

// ===== impl Fib =====

impl Fib {
    // Starts the component. Dropping the returned task cancels it.
    pub fn spawn(
        my_node_name: String,
        config: &FibConfig,
        agent: Arc<dyn FibAgentService>,
        kv: Option<KvStoreClientHandle>,
        route_updates_rx: UnboundedReceiver<RouteUpdate>,
        static_routes_rx: UnboundedReceiver<RouteUpdate>,
    ) -> (FibHandle, Task<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let heartbeat = Heartbeat::new();

        let cold_start_deadline = match config.eor_time_s {
            // Wait for the first decision publication instead.
            Some(_) => None,
            None => Some(
                Instant::now()
                    + Duration::from_millis(config.cold_start_duration_ms),
            ),
        };

        let fib = Fib {
            my_node_name,
            client_id: config.client_id,
            agent,
            kv,
            unicast: Default::default(),
            mpls: Default::default(),
            state: ProgrammingState::AwaitingFirstUpdate,
            dirty: false,
            latest_alive_since: 0,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(config.sync_initial_backoff_ms),
                Duration::from_millis(config.sync_max_backoff_ms),
            ),
            sync_deadline: None,
            cold_start_deadline,
            keep_alive_interval: Duration::from_millis(
                config.keep_alive_interval_ms,
            ),
            update_routes_sem: Arc::new(Semaphore::new(1)),
            perf_db: Default::default(),
            counters: Default::default(),
            fib_subscribers: Default::default(),
            fib_detail_subscribers: Default::default(),
            heartbeat: heartbeat.clone(),
        };

        let handle = FibHandle { cmd_tx, heartbeat };
        let task =
            Task::spawn(fib.run(route_updates_rx, static_routes_rx, cmd_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut route_updates_rx: UnboundedReceiver<RouteUpdate>,
        static_routes_rx: UnboundedReceiver<RouteUpdate>,
        mut cmd_rx: UnboundedReceiver<Command>,
    ) {
        info!("starting FIB programmer");

        // The static-route reader lives until the first decision
        // publication signals the end of replay.
        let mut static_rx = Some(static_routes_rx);

        let mut keep_alive = tokio::time::interval_at(
            Instant::now() + self.keep_alive_interval,
            self.keep_alive_interval,
        );

        loop {
            tokio::select! {
                update = route_updates_rx.recv() => {
                    let Some(mut update) = update else { break };
                    update.perf_mark(&self.my_node_name, "FIB_ROUTE_DB_RECVD");
                    if static_rx.take().is_some() {
                        debug!("first decision update, terminating static route reader");
                    }
                    self.process_decision_update(update).await;
                }
                update = recv_opt(&mut static_rx), if static_rx.is_some() => {
                    match update {
                        Some(update) => self.process_static_update(update).await,
                        None => static_rx = None,
                    }
                }
                _ = keep_alive.tick() => {
                    self.keep_alive_check().await;
                }
                _ = sleep_until_opt(self.sync_deadline) => {
                    self.sync_deadline = None;
                    self.sync_routes().await;
                }
                _ = sleep_until_opt(self.cold_start_deadline) => {
                    self.cold_start_deadline = None;
                    if self.state == ProgrammingState::AwaitingFirstUpdate {
                        info!("cold start window elapsed, syncing");
                        self.state = ProgrammingState::Syncing;
                        self.schedule_sync(Duration::ZERO);
                    }
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Stop) | None => break,
                        Some(command) => self.process_command(command),
                    }
                }
            }
            self.heartbeat.touch();
        }

        info!("FIB programmer stopped");
    }

    fn process_command(&mut self, command: Command) {
        match command {
            Command::GetRouteDb(responder) => {
                let db = RouteDatabase {
                    unicast: self
                        .unicast
                        .values()
                        .map(RibUnicastEntry::to_plain)
                        .collect(),
                    mpls: self
                        .mpls
                        .values()
                        .map(RibMplsEntry::to_plain)
                        .collect(),
                };
                let _ = responder.send(db);
            }
            Command::GetRouteDetailDb(responder) => {
                let db = RouteDatabaseDetail {
                    unicast: self.unicast.values().cloned().collect(),
                    mpls: self.mpls.values().cloned().collect(),
                };
                let _ = responder.send(db);
            }
            Command::GetUnicastRoutes(prefixes, responder) => {
                let routes = self
                    .unicast
                    .values()
                    .filter(|entry| {
                        prefixes.is_empty()
                            || prefixes
                                .iter()
                                .any(|filter| filter.covers(&entry.prefix))
                    })
                    .map(RibUnicastEntry::to_plain)
                    .collect();
                let _ = responder.send(routes);
            }
            Command::GetMplsRoutes(labels, responder) => {
                let routes = self
                    .mpls
                    .values()
                    .filter(|entry| {
                        labels.is_empty() || labels.contains(&entry.label)
                    })
                    .map(RibMplsEntry::to_plain)
                    .collect();
                let _ = responder.send(routes);
            }
            Command::GetPerfDb(responder) => {
                let _ =
                    responder.send(self.perf_db.iter().cloned().collect());
            }
            Command::LongestPrefixMatch(prefix, responder) => {
                let _ = responder
                    .send(longest_prefix_match(&prefix, &self.unicast));
            }
            Command::GetCounters(responder) => {
                let _ = responder.send(self.counters);
            }
            Command::SubscribeFib(responder) => {
                let rx = self.fib_subscribers.subscribe();
                // Synthetic initial full dump.
                self.fib_subscribers.publish(self.snapshot_delta());
                let _ = responder.send(rx);
            }
            Command::SubscribeFibDetail(responder) => {
                let rx = self.fib_detail_subscribers.subscribe();
                self.fib_detail_subscribers.publish(self.snapshot_detail());
                let _ = responder.send(rx);
            }
            Command::Stop => unreachable!(),
        }
    }

    // Decision update: merge, then program. Incremental when the agent is
    // in sync, otherwise via a scheduled full sync.
    async fn process_decision_update(&mut self, update: RouteUpdate) {
        let delta = self.apply_to_mirror(&update);

        if self.state == ProgrammingState::AwaitingFirstUpdate {
            // First (possibly empty) publication: the initial sync carries
            // the merged mirror wholesale.
            self.state = ProgrammingState::Syncing;
            self.cold_start_deadline = None;
            self.schedule_sync(Duration::ZERO);
            return;
        }

        if self.dirty || self.state != ProgrammingState::Synced {
            self.schedule_sync(self.backoff.time_remaining_until_retry());
            return;
        }

        self.program_incremental(update, delta).await;
    }

    // Static updates bypass the decision stream: only MPLS routes are
    // honored (static unicast routes are merged by the engine) and they are
    // programmed immediately, even before the initial sync.
    async fn process_static_update(&mut self, update: RouteUpdate) {
        let update = RouteUpdate {
            mpls_upserts: update.mpls_upserts,
            mpls_deletions: update.mpls_deletions,
            ..Default::default()
        };
        if update.is_empty() {
            return;
        }
        let delta = self.apply_to_mirror(&update);
        self.program_incremental(update, delta).await;
    }

    // Merges an update into the local mirror and derives what has to reach
    // the agent.
    fn apply_to_mirror(&mut self, update: &RouteUpdate) -> AgentDelta {
        let mut delta = AgentDelta::default();

        for (prefix, entry) in &update.unicast_upserts {
            let was_installed = self
                .unicast
                .get(prefix)
                .is_some_and(|old| !old.do_not_install);
            self.unicast.insert(*prefix, entry.clone());
            if entry.do_not_install {
                if was_installed {
                    delta.unicast_del.push(*prefix);
                }
            } else {
                delta.unicast_add.push(entry.to_plain());
            }
        }
        for prefix in &update.unicast_deletions {
            if let Some(old) = self.unicast.remove(prefix) {
                if !old.do_not_install {
                    delta.unicast_del.push(*prefix);
                }
            }
        }

        for (label, entry) in &update.mpls_upserts {
            self.mpls.insert(*label, entry.clone());
            delta.mpls_add.push(entry.to_plain());
        }
        for label in &update.mpls_deletions {
            if self.mpls.remove(label).is_some() {
                delta.mpls_del.push(*label);
            }
        }

        delta
    }

    // Incremental add/delete programming. Any RPC failure marks the mirror
    // dirty and falls back to the debounced full sync.
    async fn program_incremental(
        &mut self,
        mut update: RouteUpdate,
        delta: AgentDelta,
    ) {
        let Ok(_permit) = self.update_routes_sem.clone().acquire_owned().await
        else {
            return;
        };

        let result = self.program_delta(&delta).await;
        if let Err(error) = result {
            Error::from(error).log();
            self.counters.programming_failures += 1;
            self.dirty = true;
            self.backoff.report_error();
            self.schedule_sync(self.backoff.time_remaining_until_retry());
            return;
        }

        update.perf_mark(&self.my_node_name, "FIB_ROUTES_PROGRAMMED");
        self.record_perf(&update);
        self.publish_delta(update, delta);
    }

    async fn program_delta(
        &mut self,
        delta: &AgentDelta,
    ) -> Result<(), fabric_utils::agent::AgentError> {
        if !delta.unicast_add.is_empty() {
            self.agent
                .add_unicast_routes(self.client_id, delta.unicast_add.clone())
                .await?;
            self.counters.unicast_routes_added +=
                delta.unicast_add.len() as u64;
        }
        if !delta.unicast_del.is_empty() {
            self.agent
                .delete_unicast_routes(
                    self.client_id,
                    delta.unicast_del.clone(),
                )
                .await?;
            self.counters.unicast_routes_deleted +=
                delta.unicast_del.len() as u64;
        }
        if !delta.mpls_add.is_empty() {
            self.agent
                .add_mpls_routes(self.client_id, delta.mpls_add.clone())
                .await?;
            self.counters.mpls_routes_added += delta.mpls_add.len() as u64;
        }
        if !delta.mpls_del.is_empty() {
            self.agent
                .delete_mpls_routes(self.client_id, delta.mpls_del.clone())
                .await?;
            self.counters.mpls_routes_deleted += delta.mpls_del.len() as u64;
        }
        Ok(())
    }

    // Full table replacement. Clears the dirty flag on success and notifies
    // subscribers with a fresh snapshot.
    async fn sync_routes(&mut self) {
        let Ok(_permit) = self.update_routes_sem.clone().acquire_owned().await
        else {
            return;
        };

        if self.state == ProgrammingState::AwaitingFirstUpdate {
            return;
        }
        self.state = ProgrammingState::Syncing;

        let unicast: Vec<_> = self
            .unicast
            .values()
            .filter(|entry| !entry.do_not_install)
            .map(RibUnicastEntry::to_plain)
            .collect();
        let mpls: Vec<_> =
            self.mpls.values().map(RibMplsEntry::to_plain).collect();

        debug!(
            unicast = unicast.len(),
            mpls = mpls.len(),
            "syncing agent tables"
        );
        let result = async {
            self.agent.sync_fib(self.client_id, unicast).await?;
            self.agent.sync_mpls_fib(self.client_id, mpls).await
        }
        .await;

        match result {
            Ok(()) => {
                self.dirty = false;
                self.state = ProgrammingState::Synced;
                self.backoff.report_success();
                self.sync_deadline = None;
                self.counters.full_syncs += 1;

                let snapshot = self.snapshot_delta();
                self.fib_subscribers.publish(snapshot);
                let detail = self.snapshot_detail();
                self.fib_detail_subscribers.publish(detail);

                self.publish_sync_timestamp().await;
            }
            Err(error) => {
                Error::from(error).log();
                self.counters.programming_failures += 1;
                self.backoff.report_error();
                self.schedule_sync(
                    self.backoff.time_remaining_until_retry(),
                );
            }
        }
    }

    // Agent liveness probe. A changed alive-since epoch (or a first
    // observation) means the agent restarted with empty tables: force a
    // full sync.
    async fn keep_alive_check(&mut self) {
        match self.agent.alive_since().await {
            Ok(alive_since) => {
                if self.latest_alive_since != alive_since {
                    info!(
                        old = self.latest_alive_since,
                        new = alive_since,
                        "agent restart detected"
                    );
                    self.latest_alive_since = alive_since;
                    if self.state != ProgrammingState::AwaitingFirstUpdate {
                        self.dirty = true;
                        self.state = ProgrammingState::Syncing;
                        self.schedule_sync(Duration::ZERO);
                    }
                }
            }
            Err(error) => {
                self.counters.keepalive_failures += 1;
                Error::from(error).log();
            }
        }
    }

    // Publishes a programmed delta to both subscriber streams,
    // do-not-install entries filtered out.
    fn publish_delta(&mut self, update: RouteUpdate, delta: AgentDelta) {
        let plain = RouteDatabaseDelta {
            unicast_upserts: delta.unicast_add,
            unicast_deletions: delta.unicast_del,
            mpls_upserts: delta.mpls_add,
            mpls_deletions: delta.mpls_del,
        };
        if !plain.unicast_upserts.is_empty()
            || !plain.unicast_deletions.is_empty()
            || !plain.mpls_upserts.is_empty()
            || !plain.mpls_deletions.is_empty()
        {
            self.fib_subscribers.publish(plain.clone());

            let mut detail = update;
            detail
                .unicast_upserts
                .retain(|_, entry| !entry.do_not_install);
            detail.unicast_deletions = plain.unicast_deletions;
            self.fib_detail_subscribers.publish(detail);
        }
    }

    fn snapshot_delta(&self) -> RouteDatabaseDelta {
        RouteDatabaseDelta {
            unicast_upserts: self
                .unicast
                .values()
                .filter(|entry| !entry.do_not_install)
                .map(RibUnicastEntry::to_plain)
                .collect(),
            unicast_deletions: Vec::new(),
            mpls_upserts: self
                .mpls
                .values()
                .map(RibMplsEntry::to_plain)
                .collect(),
            mpls_deletions: Vec::new(),
        }
    }

    fn snapshot_detail(&self) -> RouteUpdate {
        RouteUpdate {
            unicast_upserts: self
                .unicast
                .iter()
                .filter(|(_, entry)| !entry.do_not_install)
                .map(|(prefix, entry)| (*prefix, entry.clone()))
                .collect(),
            mpls_upserts: self.mpls.clone(),
            ..Default::default()
        }
    }

    fn record_perf(&mut self, update: &RouteUpdate) {
        if let Some(perf_events) = &update.perf_events {
            self.perf_db.push_back(perf_events.clone());
            while self.perf_db.len() > PERF_DB_MAX_SIZE {
                self.perf_db.pop_front();
            }
        }
    }

    // Publishes the programming completion timestamp into the store, when a
    // KV client was provided.
    async fn publish_sync_timestamp(&self) {
        let Some(kv) = &self.kv else { return };
        let key = format!("fib-synced:{}", self.my_node_name);
        let payload = chrono::Utc::now().timestamp_millis();
        let payload = match serde_json::to_vec(&payload) {
            Ok(payload) => Bytes::from(payload),
            Err(_) => return,
        };
        if let Err(error) = kv
            .set(TIMESTAMP_AREA, &key, payload, 0, TTL_INFINITY)
            .await
        {
            warn!(%error, "failed to publish programming timestamp");
        }
    }

    fn schedule_sync(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.sync_deadline = Some(match self.sync_deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }
}

// ===== global functions =====

// Longest-prefix match over a unicast route map: the most specific entry
// whose network contains the queried prefix in its entirety.
pub fn longest_prefix_match(
    prefix: &IpNetwork,
    unicast: &BTreeMap<IpNetwork, RibUnicastEntry>,
) -> Option<IpNetwork> {
    unicast
        .keys()
        .filter(|entry| entry.covers(prefix))
        .max_by_key(|entry| entry.prefix())
        .copied()
}

// ===== helper functions =====

// Receives from an optional channel; the caller guards the select branch on
// `rx.is_some()`.
async fn recv_opt(
    rx: &mut Option<UnboundedReceiver<RouteUpdate>>,
) -> Option<RouteUpdate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
