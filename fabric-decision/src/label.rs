//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use fabric_utils::mpls::Label;
use fabric_utils::rib::NextHop;

// Reference-counted prepend-label allocator.
//
// Identical next-hop sets share a single label. Labels whose last reference
// goes away return to a free pool and are reused (lowest first) before the
// bump counter advances.
#[derive(Debug)]
pub struct PrependLabelAllocator {
    range: std::ops::RangeInclusive<u32>,
    next: u32,
    free: BTreeSet<u32>,
    bindings: BTreeMap<BTreeSet<NextHop>, (Label, usize)>,
}

// ===== impl PrependLabelAllocator =====

impl PrependLabelAllocator {
    pub fn new(range: std::ops::RangeInclusive<u32>) -> PrependLabelAllocator {
        PrependLabelAllocator {
            next: *range.start(),
            range,
            free: Default::default(),
            bindings: Default::default(),
        }
    }

    // Returns the label bound to the given next-hop set, allocating a fresh
    // one on first use. `None` means the label space is exhausted.
    pub fn acquire(
        &mut self,
        nexthops: &BTreeSet<NextHop>,
    ) -> Option<Label> {
        if let Some((label, refcount)) = self.bindings.get_mut(nexthops) {
            *refcount += 1;
            return Some(*label);
        }

        let value = match self.free.pop_first() {
            Some(value) => value,
            None => {
                if self.next > *self.range.end() {
                    return None;
                }
                let value = self.next;
                self.next += 1;
                value
            }
        };
        let label = Label::new(value);
        self.bindings.insert(nexthops.clone(), (label, 1));
        Some(label)
    }

    // Returns the label currently bound to the given next-hop set, without
    // touching the reference count.
    pub fn lookup(&self, nexthops: &BTreeSet<NextHop>) -> Option<Label> {
        self.bindings.get(nexthops).map(|(label, _)| *label)
    }

    // Drops one reference to the given next-hop set's label. Returns the
    // label if this was the last reference and it went back to the pool.
    pub fn release(
        &mut self,
        nexthops: &BTreeSet<NextHop>,
    ) -> Option<Label> {
        let (label, refcount) = self.bindings.get_mut(nexthops)?;
        *refcount -= 1;
        if *refcount > 0 {
            return None;
        }
        let label = *label;
        self.bindings.remove(nexthops);
        self.free.insert(label.get());
        Some(label)
    }
}

impl Default for PrependLabelAllocator {
    fn default() -> PrependLabelAllocator {
        PrependLabelAllocator::new(Label::PREPEND_RANGE)
    }
}
