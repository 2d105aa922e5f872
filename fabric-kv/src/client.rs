//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fabric_utils::backoff::ExponentialBackoff;
use fabric_utils::config::KvConfig;
use fabric_utils::kv::{
    KeyFilter, KvStoreService, Publication, TTL_INFINITY, Value,
};
use fabric_utils::task::{Task, sleep_until_opt};
use fabric_utils::watchdog::Heartbeat;
use fabric_utils::{Responder, UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Error;

// Callback invoked on updates of a subscribed key. `None` means the key
// expired.
pub type KeyCallback = Box<dyn FnMut(&str, Option<&Value>) + Send + Sync>;

// Counters exposed for introspection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub persisted_keys: usize,
    pub keys_to_advertise: usize,
    pub ttl_backoffs: usize,
    pub key_callbacks: usize,
}

// Requests served by the client's event loop.
enum Command {
    Set {
        area: String,
        key: String,
        payload: Bytes,
        version: u64,
        ttl_ms: i64,
        responder: Responder<Result<(), Error>>,
    },
    Unset {
        area: String,
        key: String,
    },
    Get {
        area: String,
        key: String,
        responder: Responder<Result<Option<Value>, Error>>,
    },
    Dump {
        area: String,
        prefix: String,
        responder: Responder<Result<BTreeMap<String, Value>, Error>>,
    },
    Subscribe {
        area: String,
        key: String,
        callback: KeyCallback,
        fetch: bool,
        responder: Responder<Result<Option<Value>, Error>>,
    },
    Unsubscribe {
        area: String,
        key: String,
    },
    SubscribeFilter {
        filter: KeyFilter,
        callback: KeyCallback,
    },
    UnsubscribeFilter,
    Counters {
        responder: Responder<Counters>,
    },
    Stop,
}

// Per-area client state.
#[derive(Default)]
struct AreaState {
    // Keys this node originates and keeps alive in the store.
    persisted: BTreeMap<String, Value>,
    // Advertisement backoff per persisted key.
    backoffs: BTreeMap<String, ExponentialBackoff>,
    // Keys whose advertisement is pending (new value or failed RPC).
    keys_to_advertise: BTreeSet<String>,
    // TTL refresh state per finite-TTL key: the payload-less refresh value
    // plus the refresh pacing backoff.
    ttl_backoffs: BTreeMap<String, (Value, ExponentialBackoff)>,
    // Per-key subscription callbacks.
    callbacks: BTreeMap<String, KeyCallback>,
}

// Client-side handle to a running KV client.
#[derive(Clone)]
pub struct KvStoreClientHandle {
    cmd_tx: UnboundedSender<Command>,
    heartbeat: Heartbeat,
}

// Safe client against the eventually-consistent gossip store.
//
// Owns its own event loop: store publications arrive on a dedicated
// receiver, API calls go through the command channel. Persisted keys are
// defended against foreign writes with monotonic `(version, originator,
// ttl-version)` bumps, and kept alive by periodic payload-less TTL
// refreshes.
pub struct KvStoreClient {
    node_id: String,
    store: Arc<dyn KvStoreService>,
    advertise_initial_backoff: Duration,
    advertise_max_backoff: Duration,
    areas: BTreeMap<String, AreaState>,
    filter: Option<(KeyFilter, KeyCallback)>,
    advertise_deadline: Option<Instant>,
    ttl_deadline: Option<Instant>,
    heartbeat: Heartbeat,
}

// ===== impl KvStoreClientHandle =====

impl KvStoreClientHandle {
    // Persists a key in the store. Version zero means "one higher than
    // whatever the store has". The key is refreshed until `unset`.
    pub async fn set(
        &self,
        area: &str,
        key: &str,
        payload: Bytes,
        version: u64,
        ttl_ms: i64,
    ) -> Result<(), Error> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Set {
                area: area.to_owned(),
                key: key.to_owned(),
                payload,
                version,
                ttl_ms,
                responder,
            })
            .map_err(|_| Error::ClientStopped)?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    // Stops originating a key. The store copy is left to expire.
    pub fn unset(&self, area: &str, key: &str) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::Unset {
                area: area.to_owned(),
                key: key.to_owned(),
            })
            .map_err(|_| Error::ClientStopped)
    }

    pub async fn get(
        &self,
        area: &str,
        key: &str,
    ) -> Result<Option<Value>, Error> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get {
                area: area.to_owned(),
                key: key.to_owned(),
                responder,
            })
            .map_err(|_| Error::ClientStopped)?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    pub async fn dump(
        &self,
        area: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, Value>, Error> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dump {
                area: area.to_owned(),
                prefix: prefix.to_owned(),
                responder,
            })
            .map_err(|_| Error::ClientStopped)?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    // Registers a per-key callback. With `fetch`, returns the key's current
    // value.
    pub async fn subscribe(
        &self,
        area: &str,
        key: &str,
        callback: KeyCallback,
        fetch: bool,
    ) -> Result<Option<Value>, Error> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                area: area.to_owned(),
                key: key.to_owned(),
                callback,
                fetch,
                responder,
            })
            .map_err(|_| Error::ClientStopped)?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    pub fn unsubscribe(&self, area: &str, key: &str) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::Unsubscribe {
                area: area.to_owned(),
                key: key.to_owned(),
            })
            .map_err(|_| Error::ClientStopped)
    }

    // Installs the single global prefix-filter callback.
    pub fn subscribe_filter(
        &self,
        filter: KeyFilter,
        callback: KeyCallback,
    ) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::SubscribeFilter { filter, callback })
            .map_err(|_| Error::ClientStopped)
    }

    pub fn unsubscribe_filter(&self) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::UnsubscribeFilter)
            .map_err(|_| Error::ClientStopped)
    }

    pub async fn counters(&self) -> Result<Counters, Error> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Counters { responder })
            .map_err(|_| Error::ClientStopped)?;
        rx.await.map_err(|_| Error::ClientStopped)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }
}

// ===== impl KvStoreClient =====

impl KvStoreClient {
    // Starts the client. Dropping the returned task cancels it.
    pub fn spawn(
        node_id: String,
        config: &KvConfig,
        store: Arc<dyn KvStoreService>,
        publications_rx: UnboundedReceiver<Publication>,
    ) -> (KvStoreClientHandle, Task<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let heartbeat = Heartbeat::new();

        let client = KvStoreClient {
            node_id,
            store,
            advertise_initial_backoff: Duration::from_millis(
                config.advertise_initial_backoff_ms,
            ),
            advertise_max_backoff: Duration::from_millis(
                config.advertise_max_backoff_ms,
            ),
            areas: Default::default(),
            filter: None,
            advertise_deadline: None,
            ttl_deadline: None,
            heartbeat: heartbeat.clone(),
        };

        let handle = KvStoreClientHandle { cmd_tx, heartbeat };
        let task = Task::spawn(client.run(publications_rx, cmd_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut publications_rx: UnboundedReceiver<Publication>,
        mut cmd_rx: UnboundedReceiver<Command>,
    ) {
        info!("starting KV client");

        loop {
            tokio::select! {
                publication = publications_rx.recv() => {
                    let Some(publication) = publication else { break };
                    self.process_publication(publication).await;
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Stop) | None => break,
                        Some(command) => self.process_command(command).await,
                    }
                }
                _ = sleep_until_opt(self.advertise_deadline) => {
                    self.advertise_deadline = None;
                    self.advertise_pending_keys().await;
                }
                _ = sleep_until_opt(self.ttl_deadline) => {
                    self.ttl_deadline = None;
                    self.advertise_ttl_updates().await;
                }
            }
            self.heartbeat.touch();
        }

        info!("KV client stopped");
    }

    async fn process_command(&mut self, command: Command) {
        match command {
            Command::Set {
                area,
                key,
                payload,
                version,
                ttl_ms,
                responder,
            } => {
                let result =
                    self.set_key(&area, &key, payload, version, ttl_ms).await;
                let _ = responder.send(result);
            }
            Command::Unset { area, key } => {
                self.unset_key(&area, &key);
            }
            Command::Get {
                area,
                key,
                responder,
            } => {
                let result = self.get_key(&area, &key).await;
                let _ = responder.send(result);
            }
            Command::Dump {
                area,
                prefix,
                responder,
            } => {
                let result = self
                    .store
                    .dump_key_vals(&area, &prefix)
                    .await
                    .map_err(Error::Store);
                let _ = responder.send(result);
            }
            Command::Subscribe {
                area,
                key,
                callback,
                fetch,
                responder,
            } => {
                let area_state = self.areas.entry(area.clone()).or_default();
                area_state.callbacks.insert(key.clone(), callback);
                let result = if fetch {
                    self.get_key(&area, &key).await
                } else {
                    Ok(None)
                };
                let _ = responder.send(result);
            }
            Command::Unsubscribe { area, key } => {
                if let Some(area_state) = self.areas.get_mut(&area) {
                    area_state.callbacks.remove(&key);
                }
            }
            Command::SubscribeFilter { filter, callback } => {
                self.filter = Some((filter, callback));
            }
            Command::UnsubscribeFilter => {
                self.filter = None;
            }
            Command::Counters { responder } => {
                let _ = responder.send(self.counters());
            }
            Command::Stop => unreachable!(),
        }
    }

    // Persists `key` locally and advertises it to the store. When `version`
    // is zero the next version is read from the store. Identical re-sets of
    // the same payload are no-ops apart from TTL rescheduling.
    async fn set_key(
        &mut self,
        area: &str,
        key: &str,
        payload: Bytes,
        version: u64,
        ttl_ms: i64,
    ) -> Result<(), Error> {
        // Idempotent re-set.
        if let Some(current) =
            self.areas.get(area).and_then(|a| a.persisted.get(key))
        {
            if current.payload.as_ref() == Some(&payload) {
                let (version, ttl_version) =
                    (current.version, current.ttl_version);
                self.schedule_ttl_updates(
                    area,
                    key,
                    version,
                    ttl_version,
                    ttl_ms,
                    false,
                );
                return Ok(());
            }
        }

        // Use one version number higher than currently in the store if not
        // specified.
        let version = if version != 0 {
            version
        } else {
            let key_vals = self
                .store
                .get_key_vals(area, &[key.to_owned()])
                .await
                .map_err(Error::Store)?;
            key_vals.get(key).map(|value| value.version + 1).unwrap_or(1)
        };

        let value = Value::new(
            version,
            self.node_id.clone(),
            Some(payload),
            ttl_ms,
            0,
        );

        let area_state = self.areas.entry(area.to_owned()).or_default();
        area_state.persisted.insert(key.to_owned(), value.clone());
        let initial = self.advertise_initial_backoff;
        let max = self.advertise_max_backoff;
        area_state
            .backoffs
            .entry(key.to_owned())
            .or_insert_with(|| ExponentialBackoff::new(initial, max));

        // Advertise immediately; a failure leaves the key pending for the
        // advertise cycle.
        let mut key_vals = BTreeMap::new();
        key_vals.insert(key.to_owned(), value);
        if let Err(error) = self.store.set_key_vals(area, key_vals).await {
            Error::from(error).log();
            let area_state = self.areas.get_mut(area).unwrap();
            area_state.keys_to_advertise.insert(key.to_owned());
            let backoff = area_state.backoffs.get_mut(key).unwrap();
            backoff.report_error();
            let remaining = backoff.time_remaining_until_retry();
            self.bump_advertise_deadline(remaining);
        }

        self.schedule_ttl_updates(area, key, version, 0, ttl_ms, false);
        Ok(())
    }

    // Drops a key from every local structure. The store copy is not
    // deleted; TTL expiry will take care of it.
    fn unset_key(&mut self, area: &str, key: &str) {
        debug!(%area, %key, "unset key");
        if let Some(area_state) = self.areas.get_mut(area) {
            area_state.persisted.remove(key);
            area_state.backoffs.remove(key);
            area_state.ttl_backoffs.remove(key);
            area_state.keys_to_advertise.remove(key);
        }
    }

    async fn get_key(
        &self,
        area: &str,
        key: &str,
    ) -> Result<Option<Value>, Error> {
        let mut key_vals = self
            .store
            .get_key_vals(area, &[key.to_owned()])
            .await
            .map_err(Error::Store)?;
        Ok(key_vals.remove(key))
    }

    // Tracks (or cancels) the TTL refresh cycle for a key. The first
    // refresh is delayed by one backoff unless requested otherwise; the
    // pacing window is `ttl/4 ..= ttl/4+1` so the key is renewed well
    // before expiry.
    fn schedule_ttl_updates(
        &mut self,
        area: &str,
        key: &str,
        version: u64,
        ttl_version: u64,
        ttl_ms: i64,
        advertise_immediately: bool,
    ) {
        let area_state = self.areas.entry(area.to_owned()).or_default();

        // Infinite TTL does not need refreshing.
        if ttl_ms == TTL_INFINITY {
            area_state.ttl_backoffs.remove(key);
            return;
        }

        let refresh = Value::new(
            version,
            self.node_id.clone(),
            None,
            ttl_ms,
            ttl_version,
        );
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(ttl_ms as u64 / 4),
            Duration::from_millis(ttl_ms as u64 / 4 + 1),
        );
        if !advertise_immediately {
            backoff.report_error();
        }
        let remaining = backoff.time_remaining_until_retry();
        area_state
            .ttl_backoffs
            .insert(key.to_owned(), (refresh, backoff));
        self.bump_ttl_deadline(remaining);
    }

    // Incoming store publication for one area.
    async fn process_publication(&mut self, publication: Publication) {
        let node_id = self.node_id.clone();
        let area = publication.area.clone();
        let area_state = self.areas.entry(area.clone()).or_default();

        for (key, rcvd) in &publication.key_vals {
            // Ignore TTL refreshes.
            if rcvd.is_ttl_refresh() {
                continue;
            }

            // Key set with a finite TTL but not persisted: check whether we
            // lost ownership or only trail on ttl-version.
            if !area_state.persisted.contains_key(key) {
                if let Some((set_value, _)) =
                    area_state.ttl_backoffs.get_mut(key)
                {
                    if (rcvd.version, &rcvd.originator)
                        > (set_value.version, &set_value.originator)
                    {
                        // Key lost, cancel the TTL refresh.
                        area_state.ttl_backoffs.remove(key);
                    } else if rcvd.version == set_value.version
                        && rcvd.originator == set_value.originator
                        && rcvd.ttl_version > set_value.ttl_version
                    {
                        set_value.ttl_version = rcvd.ttl_version + 1;
                    }
                }

                // Foreign key: alert the subscribers and move on.
                if let Some(callback) = area_state.callbacks.get_mut(key) {
                    (callback)(key, Some(rcvd));
                }
                if let Some((filter, callback)) = &mut self.filter {
                    if filter.matches(key) {
                        (callback)(key, Some(rcvd));
                    }
                }
                continue;
            }

            let current = area_state.persisted.get_mut(key).unwrap();

            // Ignore strictly older versions.
            if rcvd.version < current.version {
                continue;
            }

            let mut changed = false;
            if rcvd.version > current.version {
                // Take ownership back with a higher version.
                current.originator = node_id.clone();
                current.version = rcvd.version + 1;
                current.ttl_version = 0;
                changed = true;
            } else if rcvd.originator != node_id {
                // Same version from a different originator: outbid it.
                current.originator = node_id.clone();
                current.version += 1;
                current.ttl_version = 0;
                changed = true;
            } else if current.payload != rcvd.payload {
                // Our own update was reflected back with a stale payload.
                current.version += 1;
                current.ttl_version = 0;
                changed = true;
            }

            // Sync ttl-version with the refresh entry, then take the max
            // with what was received.
            if let Some((set_value, _)) = area_state.ttl_backoffs.get_mut(key)
            {
                if changed {
                    set_value.version = current.version;
                    set_value.ttl_version = 0;
                } else {
                    current.ttl_version = set_value.ttl_version;
                }
                if current.ttl_version < rcvd.ttl_version {
                    current.ttl_version = rcvd.ttl_version;
                    set_value.ttl_version = rcvd.ttl_version;
                }
            } else if current.ttl_version < rcvd.ttl_version {
                current.ttl_version = rcvd.ttl_version;
            }

            if changed {
                area_state.keys_to_advertise.insert(key.clone());
                if let Some(callback) = area_state.callbacks.get_mut(key) {
                    let current = area_state.persisted.get(key).unwrap();
                    (callback)(key, Some(current));
                }
            }
        }

        // Advertise whatever the conflict resolution queued up.
        self.advertise_pending_keys().await;

        // Expired keys: subscribers get a `None`.
        if !publication.expired_keys.is_empty() {
            let area_state = self.areas.entry(area).or_default();
            for key in &publication.expired_keys {
                if let Some(callback) = area_state.callbacks.get_mut(key) {
                    (callback)(key, None);
                }
            }
        }
    }

    // Advertise cycle: pushes pending keys whose backoff allows it, applies
    // backoff for the next round, and reschedules itself for the earliest
    // retry.
    async fn advertise_pending_keys(&mut self) {
        let store = self.store.clone();
        let initial = self.advertise_initial_backoff;
        let max = self.advertise_max_backoff;
        let mut min_timeout: Option<Duration> = None;

        for (area, area_state) in self.areas.iter_mut() {
            // Reset backoffs that served their time for keys no longer
            // pending.
            for (key, backoff) in area_state.backoffs.iter_mut() {
                if backoff.can_try_now()
                    && !area_state.keys_to_advertise.contains(key)
                {
                    backoff.report_success();
                }
            }

            if area_state.keys_to_advertise.is_empty() {
                continue;
            }

            let mut key_vals = BTreeMap::new();
            let mut keys_sent = Vec::new();
            for key in &area_state.keys_to_advertise {
                let Some(value) = area_state.persisted.get(key) else {
                    continue;
                };
                let backoff = area_state
                    .backoffs
                    .entry(key.clone())
                    .or_insert_with(|| ExponentialBackoff::new(initial, max));
                if !backoff.can_try_now() {
                    min_timeout = min_duration(
                        min_timeout,
                        backoff.time_remaining_until_retry(),
                    );
                    continue;
                }

                // Apply backoff up front so a failing store cannot be
                // hammered.
                backoff.report_error();
                min_timeout = min_duration(
                    min_timeout,
                    backoff.time_remaining_until_retry(),
                );

                key_vals.insert(key.clone(), value.clone());
                keys_sent.push(key.clone());
            }

            if key_vals.is_empty() {
                continue;
            }
            match store.set_key_vals(area, key_vals).await {
                Ok(()) => {
                    for key in keys_sent {
                        area_state.keys_to_advertise.remove(&key);
                    }
                }
                Err(error) => {
                    Error::from(error).log();
                }
            }
        }

        if let Some(timeout) = min_timeout {
            self.bump_advertise_deadline(timeout);
        }
    }

    // TTL refresh cycle: bumps ttl-version and emits a payload-less update
    // for every due key, then reschedules for the earliest refresh.
    async fn advertise_ttl_updates(&mut self) {
        let store = self.store.clone();
        let mut min_timeout: Option<Duration> = None;

        for (area, area_state) in self.areas.iter_mut() {
            let AreaState {
                persisted,
                ttl_backoffs,
                ..
            } = area_state;

            let mut key_vals = BTreeMap::new();
            for (key, (set_value, backoff)) in ttl_backoffs.iter_mut() {
                if !backoff.can_try_now() {
                    min_timeout = min_duration(
                        min_timeout,
                        backoff.time_remaining_until_retry(),
                    );
                    continue;
                }

                backoff.report_error();
                min_timeout = min_duration(
                    min_timeout,
                    backoff.time_remaining_until_retry(),
                );

                // A newer version may have been persisted meanwhile.
                if let Some(current) = persisted.get(key) {
                    if set_value.version < current.version {
                        set_value.version = current.version;
                        set_value.ttl_version = current.ttl_version;
                    }
                }

                set_value.ttl_version += 1;
                key_vals.insert(key.clone(), set_value.clone());
            }

            if key_vals.is_empty() {
                continue;
            }
            if let Err(error) = store.set_key_vals(area, key_vals).await {
                // Retried on the next refresh tick.
                Error::from(error).log();
            }
        }

        if let Some(timeout) = min_timeout {
            self.bump_ttl_deadline(timeout);
        }
    }

    fn counters(&self) -> Counters {
        let mut counters = Counters::default();
        for area_state in self.areas.values() {
            counters.persisted_keys += area_state.persisted.len();
            counters.keys_to_advertise +=
                area_state.keys_to_advertise.len();
            counters.ttl_backoffs += area_state.ttl_backoffs.len();
            counters.key_callbacks += area_state.callbacks.len();
        }
        counters
    }

    fn bump_advertise_deadline(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.advertise_deadline = Some(match self.advertise_deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }

    fn bump_ttl_deadline(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.ttl_deadline = Some(match self.ttl_deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }
}

// ===== helper functions =====

fn min_duration(
    current: Option<Duration>,
    candidate: Duration,
) -> Option<Duration> {
    Some(match current {
        Some(current) => current.min(candidate),
        None => candidate,
    })
}
