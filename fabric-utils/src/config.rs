//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

// Control-plane configuration.
//
// Parsing configuration files is the daemon shell's business; the components
// only ever see these structs.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub node_name: String,
    pub decision: DecisionConfig,
    pub fib: FibConfig,
    pub kv: KvConfig,
    pub watchdog: WatchdogConfig,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct DecisionConfig {
    // Program v4 prefixes. When unset, v4 routes are dropped.
    pub enable_v4: bool,
    // Attach PUSH/SWAP actions using node segment labels.
    pub node_segment_label_enabled: bool,
    // Install POP routes for adjacency labels.
    pub adjacency_labels_enabled: bool,
    // Honor BGP-flagged announcements.
    pub bgp_route_programming: bool,
    // Enable the metric-vector selection path. When unset, selection
    // degrades to shortest IGP distance.
    pub best_route_selection: bool,
    // Emit v4 prefixes with v6 next-hops.
    pub v4_over_v6_nexthop: bool,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct FibConfig {
    // Client identifier used for all agent RPCs.
    pub client_id: i16,
    // Programming suppression window at startup.
    pub cold_start_duration_ms: u64,
    // When set, the first sync waits for the first decision publication
    // instead of the cold-start timer.
    pub eor_time_s: Option<u64>,
    // Agent liveness probing period.
    pub keep_alive_interval_ms: u64,
    // Resync backoff bounds.
    pub sync_initial_backoff_ms: u64,
    pub sync_max_backoff_ms: u64,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct KvConfig {
    // Per-key advertisement backoff bounds.
    pub advertise_initial_backoff_ms: u64,
    pub advertise_max_backoff_ms: u64,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_s: u64,
    pub thread_timeout_s: u64,
    pub max_memory_mb: u64,
}

// ===== impl DecisionConfig =====

impl Default for DecisionConfig {
    fn default() -> DecisionConfig {
        DecisionConfig {
            enable_v4: false,
            node_segment_label_enabled: true,
            adjacency_labels_enabled: true,
            bgp_route_programming: false,
            best_route_selection: true,
            v4_over_v6_nexthop: false,
        }
    }
}

// ===== impl FibConfig =====

impl Default for FibConfig {
    fn default() -> FibConfig {
        FibConfig {
            client_id: 786,
            cold_start_duration_ms: 10_000,
            eor_time_s: None,
            keep_alive_interval_ms: 20_000,
            sync_initial_backoff_ms: 8,
            sync_max_backoff_ms: 4_096,
        }
    }
}

// ===== impl KvConfig =====

impl Default for KvConfig {
    fn default() -> KvConfig {
        KvConfig {
            advertise_initial_backoff_ms: 64,
            advertise_max_backoff_ms: 8_192,
        }
    }
}

// ===== impl WatchdogConfig =====

impl Default for WatchdogConfig {
    fn default() -> WatchdogConfig {
        WatchdogConfig {
            interval_s: 20,
            thread_timeout_s: 300,
            max_memory_mb: 800,
        }
    }
}
