//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use derive_new::new;
use fabric_utils::rib::{NodeAndArea, PrefixEntry};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::link_state::NodeName;

// All announcements of one prefix, keyed by announcing (node, area).
pub type PrefixEntries = BTreeMap<NodeAndArea, Arc<PrefixEntry>>;

// Full set of prefixes announced by one node, as carried in the store.
#[derive(Clone, Debug, Default, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct PrefixDatabase {
    pub node: NodeName,
    pub entries: Vec<PrefixEntry>,
}

// Multi-area prefix map: prefix -> set of announcements.
#[derive(Debug, Default)]
pub struct PrefixState {
    prefixes: BTreeMap<IpNetwork, PrefixEntries>,
    // Reverse index: which prefixes each (node, area) currently announces.
    originated: BTreeMap<NodeAndArea, BTreeSet<IpNetwork>>,
}

// ===== impl PrefixState =====

impl PrefixState {
    // Replaces the set of prefixes announced by `node_area` with the given
    // database. Returns every prefix whose announcement set changed.
    pub fn apply_prefix_database(
        &mut self,
        node_area: NodeAndArea,
        db: &PrefixDatabase,
    ) -> BTreeSet<IpNetwork> {
        let mut changed = BTreeSet::new();

        let old_prefixes = self
            .originated
            .get(&node_area)
            .cloned()
            .unwrap_or_default();
        let new_prefixes: BTreeSet<_> =
            db.entries.iter().map(|entry| entry.prefix).collect();

        // Withdraw prefixes no longer announced.
        for prefix in old_prefixes.difference(&new_prefixes) {
            self.remove_entry(prefix, &node_area);
            changed.insert(*prefix);
        }

        // Insert or update the announced prefixes.
        for entry in &db.entries {
            let prefix = entry.prefix;
            let entries = self.prefixes.entry(prefix).or_default();
            let entry = Arc::new(entry.clone());
            if entries.get(&node_area).map(|cur| cur.as_ref())
                != Some(entry.as_ref())
            {
                entries.insert(node_area.clone(), entry);
                changed.insert(prefix);
            }
        }

        if new_prefixes.is_empty() {
            self.originated.remove(&node_area);
        } else {
            self.originated.insert(node_area, new_prefixes);
        }

        changed
    }

    // Withdraws everything announced by `node_area` (e.g. on key expiry).
    pub fn remove_node(
        &mut self,
        node_area: &NodeAndArea,
    ) -> BTreeSet<IpNetwork> {
        let prefixes = self.originated.remove(node_area).unwrap_or_default();
        for prefix in &prefixes {
            self.remove_entry(prefix, node_area);
        }
        prefixes
    }

    pub fn prefixes(
        &self,
    ) -> impl Iterator<Item = (&IpNetwork, &PrefixEntries)> {
        self.prefixes.iter()
    }

    pub fn entries(&self, prefix: &IpNetwork) -> Option<&PrefixEntries> {
        self.prefixes.get(prefix)
    }

    fn remove_entry(&mut self, prefix: &IpNetwork, node_area: &NodeAndArea) {
        if let Some(entries) = self.prefixes.get_mut(prefix) {
            entries.remove(node_area);
            if entries.is_empty() {
                self.prefixes.remove(prefix);
            }
        }
    }
}
