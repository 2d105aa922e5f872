//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use derive_new::new;
use serde::{Deserialize, Serialize};

// TTL value meaning "never expires".
pub const TTL_INFINITY: i64 = i64::MAX;

// A versioned value as stored in the gossip fabric.
//
// A value without a payload is a TTL refresh: it bumps `ttl_version` without
// touching the payload version. Two values for the same key are ordered by
// `(version, originator, ttl_version)`, higher wins.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Value {
    pub version: u64,
    pub originator: String,
    pub payload: Option<Bytes>,
    pub ttl_ms: i64,
    pub ttl_version: u64,
}

// Batch of key updates published by the store for one area.
#[derive(Clone, Debug, Default, new)]
#[derive(Deserialize, Serialize)]
pub struct Publication {
    pub area: String,
    pub key_vals: BTreeMap<String, Value>,
    pub expired_keys: Vec<String>,
}

// Key prefix filter. An empty prefix list matches every key.
#[derive(Clone, Debug, Default, new)]
pub struct KeyFilter {
    pub prefixes: Vec<String>,
}

// KV store RPC errors.
#[derive(Debug)]
pub enum KvStoreError {
    Rpc(std::io::Error),
}

// Client-side view of the gossip store.
//
// The store itself lives elsewhere; this is the full surface the control
// plane relies on. All operations are at-least-once and may be retried by
// callers.
#[async_trait]
pub trait KvStoreService: Send + Sync {
    // Fetches the given keys. Missing keys are absent from the result.
    async fn get_key_vals(
        &self,
        area: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, KvStoreError>;

    // Fetches all keys matching the given prefix (all keys if empty).
    async fn dump_key_vals(
        &self,
        area: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, Value>, KvStoreError>;

    // Merges the given key-values into the store.
    async fn set_key_vals(
        &self,
        area: &str,
        key_vals: BTreeMap<String, Value>,
    ) -> Result<(), KvStoreError>;
}

// ===== impl Value =====

impl Value {
    // Compares two values under the store's conflict-resolution ordering.
    pub fn cmp_versions(&self, other: &Value) -> Ordering {
        (self.version, &self.originator, self.ttl_version).cmp(&(
            other.version,
            &other.originator,
            other.ttl_version,
        ))
    }

    // Returns true if this value is a payload-less TTL refresh.
    pub fn is_ttl_refresh(&self) -> bool {
        self.payload.is_none()
    }
}

// ===== impl KeyFilter =====

impl KeyFilter {
    pub fn matches(&self, key: &str) -> bool {
        self.prefixes.is_empty()
            || self.prefixes.iter().any(|prefix| key.starts_with(prefix))
    }
}

// ===== impl KvStoreError =====

impl std::fmt::Display for KvStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvStoreError::Rpc(..) => {
                write!(f, "KV store request failed")
            }
        }
    }
}

impl std::error::Error for KvStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KvStoreError::Rpc(error) => Some(error),
        }
    }
}
