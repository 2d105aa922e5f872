//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use async_trait::async_trait;
use derive_new::new;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::mpls::Label;
use crate::rib::NextHop;

// Unicast route as programmed into the forwarding agent.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct UnicastRoute {
    pub prefix: IpNetwork,
    pub nexthops: BTreeSet<NextHop>,
}

// MPLS route as programmed into the forwarding agent.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct MplsRoute {
    pub label: Label,
    pub nexthops: BTreeSet<NextHop>,
}

// Forwarding-agent RPC errors.
#[derive(Debug)]
pub enum AgentError {
    Rpc(std::io::Error),
}

// Platform-specific forwarding agent.
//
// All operations are idempotent. `sync_*` replaces the agent's entire table
// for the given client id.
#[async_trait]
pub trait FibAgentService: Send + Sync {
    async fn add_unicast_routes(
        &self,
        client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), AgentError>;

    async fn delete_unicast_routes(
        &self,
        client_id: i16,
        prefixes: Vec<IpNetwork>,
    ) -> Result<(), AgentError>;

    async fn sync_fib(
        &self,
        client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), AgentError>;

    async fn add_mpls_routes(
        &self,
        client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), AgentError>;

    async fn delete_mpls_routes(
        &self,
        client_id: i16,
        labels: Vec<Label>,
    ) -> Result<(), AgentError>;

    async fn sync_mpls_fib(
        &self,
        client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), AgentError>;

    // Epoch at which the agent last started. A change means the agent
    // restarted and lost its table.
    async fn alive_since(&self) -> Result<i64, AgentError>;
}

// ===== impl AgentError =====

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Rpc(..) => {
                write!(f, "forwarding agent request failed")
            }
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Rpc(error) => Some(error),
        }
    }
}
