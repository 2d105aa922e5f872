//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// End-to-end: store publications feed the decision engine, whose deltas
// drive the FIB programmer against a mock agent. After quiescence the
// agent's table must equal the computed routes.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fabric_decision::Decision;
use fabric_decision::link_state::{Adjacency, AdjacencyDatabase};
use fabric_decision::prefix_state::PrefixDatabase;
use fabric_fib::Fib;
use fabric_kv::KvStoreClient;
use fabric_utils::agent::{
    AgentError, FibAgentService, MplsRoute, UnicastRoute,
};
use fabric_utils::config::{DecisionConfig, FibConfig, KvConfig};
use fabric_utils::kv::{
    KvStoreError, KvStoreService, Publication, TTL_INFINITY, Value,
};
use fabric_utils::mpls::{Label, MplsAction};
use fabric_utils::rib::{
    ForwardingAlgorithm, ForwardingType, PrefixEntry, PrefixEntryFlags,
    PrefixMetrics,
};
use ipnetwork::IpNetwork;
use tokio::sync::mpsc;

const AREA: &str = "0";

#[derive(Clone, Debug, Default)]
struct AgentTables {
    unicast: BTreeMap<IpNetwork, UnicastRoute>,
    mpls: BTreeMap<Label, MplsRoute>,
}

#[derive(Default)]
struct MockAgent(Mutex<AgentTables>);

#[async_trait]
impl FibAgentService for MockAgent {
    async fn add_unicast_routes(
        &self,
        _client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), AgentError> {
        let mut tables = self.0.lock().unwrap();
        for route in routes {
            tables.unicast.insert(route.prefix, route);
        }
        Ok(())
    }

    async fn delete_unicast_routes(
        &self,
        _client_id: i16,
        prefixes: Vec<IpNetwork>,
    ) -> Result<(), AgentError> {
        let mut tables = self.0.lock().unwrap();
        for prefix in prefixes {
            tables.unicast.remove(&prefix);
        }
        Ok(())
    }

    async fn sync_fib(
        &self,
        _client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), AgentError> {
        self.0.lock().unwrap().unicast =
            routes.into_iter().map(|route| (route.prefix, route)).collect();
        Ok(())
    }

    async fn add_mpls_routes(
        &self,
        _client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), AgentError> {
        let mut tables = self.0.lock().unwrap();
        for route in routes {
            tables.mpls.insert(route.label, route);
        }
        Ok(())
    }

    async fn delete_mpls_routes(
        &self,
        _client_id: i16,
        labels: Vec<Label>,
    ) -> Result<(), AgentError> {
        let mut tables = self.0.lock().unwrap();
        for label in labels {
            tables.mpls.remove(&label);
        }
        Ok(())
    }

    async fn sync_mpls_fib(
        &self,
        _client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), AgentError> {
        self.0.lock().unwrap().mpls =
            routes.into_iter().map(|route| (route.label, route)).collect();
        Ok(())
    }

    async fn alive_since(&self) -> Result<i64, AgentError> {
        Ok(1)
    }
}

fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn kv_value(payload: Vec<u8>) -> Value {
    Value::new(
        1,
        "store".to_owned(),
        Some(Bytes::from(payload)),
        TTL_INFINITY,
        0,
    )
}

fn publication(key_vals: Vec<(String, Value)>) -> Publication {
    Publication::new(AREA.to_owned(), key_vals.into_iter().collect(), Vec::new())
}

fn adjacency(
    remote: &str,
    local_if: &str,
    remote_if: &str,
    nexthop_v6: &str,
) -> Adjacency {
    Adjacency::new(
        remote.to_owned(),
        local_if.to_owned(),
        remote_if.to_owned(),
        1,
        None,
        addr(nexthop_v6),
        None,
        false,
    )
}

#[tokio::test(start_paused = true)]
async fn publications_to_programmed_routes() {
    let (pub_tx, pub_rx) = mpsc::unbounded_channel();
    let (_decision_static_tx, decision_static_rx) = mpsc::unbounded_channel();
    let (route_tx, route_rx) = mpsc::unbounded_channel();
    let (_fib_static_tx, fib_static_rx) = mpsc::unbounded_channel();

    let (decision_handle, _decision_task) = Decision::spawn(
        "node1".to_owned(),
        &DecisionConfig::default(),
        Vec::new(),
        pub_rx,
        decision_static_rx,
        route_tx,
    );

    let agent = Arc::new(MockAgent::default());
    let fib_config = FibConfig {
        eor_time_s: Some(1),
        keep_alive_interval_ms: 3_600_000,
        ..Default::default()
    };
    let (fib_handle, _fib_task) = Fib::spawn(
        "node1".to_owned(),
        &fib_config,
        agent.clone(),
        None,
        route_rx,
        fib_static_rx,
    );

    // node1 --- node2, node2 announces an SR-MPLS prefix.
    let node1 = AdjacencyDatabase::new(
        "node1".to_owned(),
        false,
        Some(Label::new(101)),
        vec![adjacency("node2", "if_1_2", "if_2_1", "fe80::2")],
    );
    let node2 = AdjacencyDatabase::new(
        "node2".to_owned(),
        false,
        Some(Label::new(102)),
        vec![adjacency("node1", "if_2_1", "if_1_2", "fe80::1")],
    );
    let prefix_db = PrefixDatabase::new(
        "node2".to_owned(),
        vec![PrefixEntry::new(
            net("2001:db8::2/128"),
            ForwardingType::SrMpls,
            ForwardingAlgorithm::SpEcmp,
            PrefixMetrics::new(0, 0, 0),
            PrefixEntryFlags::empty(),
            None,
            None,
        )],
    );
    pub_tx
        .send(publication(vec![
            (
                "adj:node1".to_owned(),
                kv_value(serde_json::to_vec(&node1).unwrap()),
            ),
            (
                "adj:node2".to_owned(),
                kv_value(serde_json::to_vec(&node2).unwrap()),
            ),
            (
                "prefix:node2".to_owned(),
                kv_value(serde_json::to_vec(&prefix_db).unwrap()),
            ),
        ]))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The agent converged on the computed routes: the unicast prefix plus
    // node2's segment label route.
    let tables = agent.0.lock().unwrap().clone();
    let route = &tables.unicast[&net("2001:db8::2/128")];
    let nexthop = route.nexthops.first().unwrap();
    assert_eq!(nexthop.addr, addr("fe80::2"));
    assert_eq!(nexthop.ifname, "if_1_2");
    // Penultimate hop toward the destination: no label pushed.
    assert_eq!(nexthop.mpls_action, None);

    let label_route = &tables.mpls[&Label::new(102)];
    assert_eq!(
        label_route.nexthops.first().unwrap().mpls_action,
        Some(MplsAction::Php)
    );

    // Withdrawal propagates all the way to the agent.
    let withdraw = PrefixDatabase::new("node2".to_owned(), Vec::new());
    pub_tx
        .send(publication(vec![(
            "prefix:node2".to_owned(),
            kv_value(serde_json::to_vec(&withdraw).unwrap()),
        )]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tables = agent.0.lock().unwrap().clone();
    assert!(!tables.unicast.contains_key(&net("2001:db8::2/128")));
    assert!(tables.mpls.contains_key(&Label::new(102)));

    // The FIB mirror agrees with the decision database.
    let decision_db = decision_handle.get_route_db().await.unwrap();
    let fib_db = fib_handle.get_route_detail_db().await.unwrap();
    assert_eq!(decision_db.unicast.len(), fib_db.unicast.len());
    assert_eq!(decision_db.mpls.len(), fib_db.mpls.len());
}

//
// Programming-timestamp publication through the KV client.
//

#[derive(Default)]
struct MockStore(Mutex<BTreeMap<String, Value>>);

#[async_trait]
impl KvStoreService for MockStore {
    async fn get_key_vals(
        &self,
        _area: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, KvStoreError> {
        let state = self.0.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| {
                state.get(key).map(|value| (key.clone(), value.clone()))
            })
            .collect())
    }

    async fn dump_key_vals(
        &self,
        _area: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, Value>, KvStoreError> {
        let state = self.0.lock().unwrap();
        Ok(state
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn set_key_vals(
        &self,
        _area: &str,
        key_vals: BTreeMap<String, Value>,
    ) -> Result<(), KvStoreError> {
        self.0.lock().unwrap().extend(key_vals);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn sync_timestamp_is_published() {
    let store = Arc::new(MockStore::default());
    let (_kv_pub_tx, kv_pub_rx) = mpsc::unbounded_channel();
    let (kv_handle, _kv_task) = KvStoreClient::spawn(
        "node1".to_owned(),
        &KvConfig::default(),
        store.clone(),
        kv_pub_rx,
    );

    let agent = Arc::new(MockAgent::default());
    let (route_tx, route_rx) = mpsc::unbounded_channel();
    let (_static_tx, static_rx) = mpsc::unbounded_channel();
    let fib_config = FibConfig {
        eor_time_s: Some(1),
        keep_alive_interval_ms: 3_600_000,
        ..Default::default()
    };
    let (_fib_handle, _fib_task) = Fib::spawn(
        "node1".to_owned(),
        &fib_config,
        agent,
        Some(kv_handle),
        route_rx,
        static_rx,
    );

    // The first sync publishes the programming completion timestamp.
    route_tx.send(Default::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = store.0.lock().unwrap();
    let value = state.get("fib-synced:node1").unwrap();
    assert_eq!(value.originator, "node1");
    assert!(value.payload.is_some());
}
