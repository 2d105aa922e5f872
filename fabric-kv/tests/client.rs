//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fabric_kv::KvStoreClient;
use fabric_utils::config::KvConfig;
use fabric_utils::kv::{
    KeyFilter, KvStoreError, KvStoreService, Publication, TTL_INFINITY, Value,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;

const AREA: &str = "0";
const NODE: &str = "node1";

//
// In-memory store double.
//

#[derive(Default)]
struct MockStore {
    state: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    set_calls: AtomicUsize,
    // Upcoming set_key_vals calls to fail.
    fail_sets: AtomicUsize,
}

impl MockStore {
    fn value(&self, area: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .get(area)
            .and_then(|keys| keys.get(key))
            .cloned()
    }

    fn fail_next_sets(&self, count: usize) {
        self.fail_sets.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStoreService for MockStore {
    async fn get_key_vals(
        &self,
        area: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, KvStoreError> {
        let state = self.state.lock().unwrap();
        let mut result = BTreeMap::new();
        if let Some(area_keys) = state.get(area) {
            for key in keys {
                if let Some(value) = area_keys.get(key) {
                    result.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(result)
    }

    async fn dump_key_vals(
        &self,
        area: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, Value>, KvStoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .get(area)
            .map(|area_keys| {
                area_keys
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_key_vals(
        &self,
        area: &str,
        key_vals: BTreeMap<String, Value>,
    ) -> Result<(), KvStoreError> {
        if self
            .fail_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
        {
            return Err(KvStoreError::Rpc(std::io::Error::other("injected")));
        }
        self.set_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let area_keys = state.entry(area.to_owned()).or_default();
        for (key, value) in key_vals {
            match area_keys.get_mut(&key) {
                None => {
                    area_keys.insert(key, value);
                }
                Some(current) => {
                    if value.cmp_versions(current)
                        == std::cmp::Ordering::Greater
                    {
                        if value.is_ttl_refresh() {
                            // TTL refresh: keep the payload.
                            current.version = value.version;
                            current.originator = value.originator;
                            current.ttl_ms = value.ttl_ms;
                            current.ttl_version = value.ttl_version;
                        } else {
                            *current = value;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

//
// Helper functions.
//

struct Harness {
    store: Arc<MockStore>,
    handle: fabric_kv::KvStoreClientHandle,
    pub_tx: UnboundedSender<Publication>,
    _task: fabric_utils::task::Task<()>,
}

fn start_client() -> Harness {
    let store = Arc::new(MockStore::default());
    let (pub_tx, pub_rx) = mpsc::unbounded_channel();
    let (handle, task) = KvStoreClient::spawn(
        NODE.to_owned(),
        &KvConfig::default(),
        store.clone(),
        pub_rx,
    );
    Harness {
        store,
        handle,
        pub_tx,
        _task: task,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn payload(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

//
// Tests.
//

#[tokio::test(start_paused = true)]
async fn set_resolves_versions() {
    let h = start_client();

    // Version 0 on an empty store: start at 1.
    h.handle
        .set(AREA, "k1", payload("v1"), 0, TTL_INFINITY)
        .await
        .unwrap();
    let stored = h.store.value(AREA, "k1").unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.originator, NODE);

    // Identical payload again: idempotent, no extra store write.
    let writes = h.store.set_calls.load(Ordering::SeqCst);
    h.handle
        .set(AREA, "k1", payload("v1"), 0, TTL_INFINITY)
        .await
        .unwrap();
    assert_eq!(h.store.set_calls.load(Ordering::SeqCst), writes);

    // A new payload with version 0 reads the store and bumps.
    h.handle
        .set(AREA, "k1", payload("v2"), 0, TTL_INFINITY)
        .await
        .unwrap();
    let stored = h.store.value(AREA, "k1").unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.payload, Some(payload("v2")));
}

#[tokio::test(start_paused = true)]
async fn version_conflict_takes_ownership_back() {
    let h = start_client();

    // Watch our own key.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    h.handle
        .subscribe(
            AREA,
            "k",
            Box::new(move |_, value| {
                seen_cb.lock().unwrap().push(value.cloned());
            }),
            false,
        )
        .await
        .unwrap();

    h.handle
        .set(AREA, "k", payload("v1"), 3, TTL_INFINITY)
        .await
        .unwrap();
    assert_eq!(h.store.value(AREA, "k").unwrap().version, 3);

    // A foreign write at a higher version comes back from the store.
    h.pub_tx
        .send(Publication::new(
            AREA.to_owned(),
            [(
                "k".to_owned(),
                Value::new(
                    5,
                    "peer".to_owned(),
                    Some(payload("v1-peer")),
                    TTL_INFINITY,
                    0,
                ),
            )]
            .into_iter()
            .collect(),
            Vec::new(),
        ))
        .unwrap();
    settle().await;

    // Ownership is taken back: version 6, our originator, our payload, and
    // the winning value re-advertised to the store.
    let stored = h.store.value(AREA, "k").unwrap();
    assert_eq!(stored.version, 6);
    assert_eq!(stored.originator, NODE);
    assert_eq!(stored.payload, Some(payload("v1")));
    assert_eq!(stored.ttl_version, 0);

    // The callback observed the re-owned value.
    let seen = seen.lock().unwrap();
    let last = seen.last().unwrap().as_ref().unwrap();
    assert_eq!(last.version, 6);
    assert_eq!(last.originator, NODE);
}

#[tokio::test(start_paused = true)]
async fn ttl_refresh_cycle() {
    let h = start_client();

    h.handle
        .set(AREA, "kt", payload("v"), 0, 1000)
        .await
        .unwrap();
    let stored = h.store.value(AREA, "kt").unwrap();
    assert_eq!(stored.ttl_version, 0);

    // Refreshes run roughly every ttl/4.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let stored = h.store.value(AREA, "kt").unwrap();
    assert!(stored.ttl_version >= 1);
    // The refresh is payload-preserving and version-stable.
    assert_eq!(stored.version, 1);
    assert_eq!(stored.payload, Some(payload("v")));

    // Unset stops the cycle.
    h.handle.unset(AREA, "kt").unwrap();
    settle().await;
    let before = h.store.value(AREA, "kt").unwrap().ttl_version;
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(h.store.value(AREA, "kt").unwrap().ttl_version, before);

    let counters = h.handle.counters().await.unwrap();
    assert_eq!(counters.persisted_keys, 0);
    assert_eq!(counters.ttl_backoffs, 0);
}

#[tokio::test(start_paused = true)]
async fn subscriptions_and_expiry() {
    let h = start_client();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    h.handle
        .subscribe(
            AREA,
            "foreign",
            Box::new(move |_, value| {
                seen_cb.lock().unwrap().push(value.cloned());
            }),
            false,
        )
        .await
        .unwrap();

    // A foreign key update fires the callback.
    h.pub_tx
        .send(Publication::new(
            AREA.to_owned(),
            [(
                "foreign".to_owned(),
                Value::new(1, "peer".to_owned(), Some(payload("x")), 5000, 0),
            )]
            .into_iter()
            .collect(),
            Vec::new(),
        ))
        .unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(seen.lock().unwrap()[0].is_some());

    // Expiry fires it with `None`.
    h.pub_tx
        .send(Publication::new(
            AREA.to_owned(),
            Default::default(),
            vec!["foreign".to_owned()],
        ))
        .unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert!(seen.lock().unwrap()[1].is_none());
}

#[tokio::test(start_paused = true)]
async fn prefix_filter_callback() {
    let h = start_client();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    h.handle
        .subscribe_filter(
            KeyFilter::new(vec!["adj:".to_owned()]),
            Box::new(move |key, _| {
                seen_cb.lock().unwrap().push(key.to_owned());
            }),
        )
        .unwrap();

    let value = Value::new(1, "peer".to_owned(), Some(payload("x")), 5000, 0);
    h.pub_tx
        .send(Publication::new(
            AREA.to_owned(),
            [
                ("adj:node2".to_owned(), value.clone()),
                ("prefix:node2".to_owned(), value.clone()),
            ]
            .into_iter()
            .collect(),
            Vec::new(),
        ))
        .unwrap();
    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec!["adj:node2".to_owned()]);

    // After unsubscribing nothing more is delivered.
    h.handle.unsubscribe_filter().unwrap();
    h.pub_tx
        .send(Publication::new(
            AREA.to_owned(),
            [("adj:node3".to_owned(), value)].into_iter().collect(),
            Vec::new(),
        ))
        .unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn advertise_retries_with_backoff() {
    let h = start_client();

    // The first three writes fail; the key must eventually land anyway.
    h.store.fail_next_sets(3);
    h.handle
        .set(AREA, "kr", payload("v"), 0, TTL_INFINITY)
        .await
        .unwrap();
    assert!(h.store.value(AREA, "kr").is_none());
    let counters = h.handle.counters().await.unwrap();
    assert_eq!(counters.keys_to_advertise, 1);

    // Backoff: 64ms, 128ms, 256ms. Give it a second of virtual time.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let stored = h.store.value(AREA, "kr").unwrap();
    assert_eq!(stored.version, 1);
    let counters = h.handle.counters().await.unwrap();
    assert_eq!(counters.keys_to_advertise, 0);
}

#[tokio::test(start_paused = true)]
async fn get_and_dump() {
    let h = start_client();

    h.handle
        .set(AREA, "adj:node1", payload("a"), 0, TTL_INFINITY)
        .await
        .unwrap();
    h.handle
        .set(AREA, "prefix:node1", payload("p"), 0, TTL_INFINITY)
        .await
        .unwrap();

    let value = h.handle.get(AREA, "adj:node1").await.unwrap().unwrap();
    assert_eq!(value.payload, Some(payload("a")));
    assert!(h.handle.get(AREA, "missing").await.unwrap().is_none());

    let dump = h.handle.dump(AREA, "adj:").await.unwrap();
    assert_eq!(dump.len(), 1);
    assert!(dump.contains_key("adj:node1"));

    let dump = h.handle.dump(AREA, "").await.unwrap();
    assert_eq!(dump.len(), 2);
}
