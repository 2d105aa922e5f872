//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use derive_new::new;
use fabric_utils::ip::IpNetworkExt;
use fabric_utils::rib::ForwardingAlgorithm;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::prefix_state::PrefixEntries;
use crate::solver::RouteSelectionResult;

// Route computation overrides produced by policy evaluation.
#[derive(Clone, Debug, Default, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct RouteComputationRules {
    // When set, overrides the announcement's forwarding algorithm.
    pub forwarding_algorithm: Option<ForwardingAlgorithm>,
    // Allocate a prepend label for the route's next-hop set.
    pub prepend_label: bool,
}

// Match criteria of one SR policy.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PolicyMatcher {
    // Matches when the best announcement originates from the given node.
    OriginatorNode(String),
    // Matches prefixes covered by the given network.
    PrefixWithin(IpNetwork),
}

#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct SrPolicy {
    pub name: String,
    pub matcher: PolicyMatcher,
    pub rules: RouteComputationRules,
}

// ===== impl SrPolicy =====

impl SrPolicy {
    fn matches(
        &self,
        prefix: &IpNetwork,
        selection: &RouteSelectionResult,
    ) -> bool {
        match &self.matcher {
            PolicyMatcher::OriginatorNode(node) => {
                selection.best.node == *node
            }
            PolicyMatcher::PrefixWithin(network) => network.covers(prefix),
        }
    }
}

// ===== global functions =====

// Walks the ordered policy list and returns the rules of the first match,
// falling back to defaults derived from the announcement itself. Pure
// function of its inputs.
pub(crate) fn get_route_computation_rules(
    policies: &[SrPolicy],
    prefix: &IpNetwork,
    _prefix_entries: &PrefixEntries,
    selection: &RouteSelectionResult,
) -> RouteComputationRules {
    policies
        .iter()
        .find(|policy| policy.matches(prefix, selection))
        .map(|policy| policy.rules.clone())
        .unwrap_or_default()
}
