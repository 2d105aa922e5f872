//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use fabric_utils::mpls::Label;
use fabric_utils::rib::{RibMplsEntry, RibUnicastEntry, RouteUpdate};
use ipnetwork::IpNetwork;

// The decision engine's computed route database.
//
// Each prefix and each label appears at most once; inserting a duplicate is
// a programming fault, not an input error.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DecisionRouteDb {
    pub unicast: BTreeMap<IpNetwork, RibUnicastEntry>,
    pub mpls: BTreeMap<Label, RibMplsEntry>,
}

// ===== impl DecisionRouteDb =====

impl DecisionRouteDb {
    pub fn add_unicast_route(&mut self, entry: RibUnicastEntry) {
        let prefix = entry.prefix;
        let prev = self.unicast.insert(prefix, entry);
        assert!(prev.is_none(), "duplicate unicast route: {}", prefix);
    }

    pub fn add_mpls_route(&mut self, entry: RibMplsEntry) {
        let label = entry.label;
        let prev = self.mpls.insert(label, entry);
        assert!(prev.is_none(), "duplicate MPLS route: {}", label);
    }

    // Calculates the delta that turns this database into `new_db`. Applying
    // the returned update to `self` yields exactly `new_db`.
    pub fn calculate_update(&self, new_db: &DecisionRouteDb) -> RouteUpdate {
        let mut update = RouteUpdate::default();

        for (prefix, entry) in &new_db.unicast {
            if self.unicast.get(prefix) != Some(entry) {
                update.unicast_upserts.insert(*prefix, entry.clone());
            }
        }
        for prefix in self.unicast.keys() {
            if !new_db.unicast.contains_key(prefix) {
                update.unicast_deletions.push(*prefix);
            }
        }

        for (label, entry) in &new_db.mpls {
            if self.mpls.get(label) != Some(entry) {
                update.mpls_upserts.insert(*label, entry.clone());
            }
        }
        for label in self.mpls.keys() {
            if !new_db.mpls.contains_key(label) {
                update.mpls_deletions.push(*label);
            }
        }

        update
    }

    // Applies a delta in place.
    pub fn update(&mut self, update: &RouteUpdate) {
        for (prefix, entry) in &update.unicast_upserts {
            self.unicast.insert(*prefix, entry.clone());
        }
        for prefix in &update.unicast_deletions {
            self.unicast.remove(prefix);
        }
        for (label, entry) in &update.mpls_upserts {
            self.mpls.insert(*label, entry.clone());
        }
        for label in &update.mpls_deletions {
            self.mpls.remove(label);
        }
    }
}
