//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

// MPLS label.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct Label(u32);

// MPLS operation attached to a next-hop.
//
// `Push` carries the full stack to impose, outermost label first. `Php`
// instructs the penultimate hop to remove the top label instead of swapping.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum MplsAction {
    Push(Vec<Label>),
    Swap(Label),
    Php,
    Pop,
}

// ===== impl Label =====

impl Label {
    // MPLS label ranges.
    pub const RESERVED_RANGE: std::ops::RangeInclusive<u32> = 0..=15;
    pub const UNRESERVED_RANGE: std::ops::RangeInclusive<u32> = 16..=1048575;

    // Label block reserved for prepend labels generated by the decision
    // engine.
    pub const PREPEND_RANGE: std::ops::RangeInclusive<u32> = 60000..=69999;

    pub fn new(label: u32) -> Label {
        if label > *Self::UNRESERVED_RANGE.end() {
            panic!("invalid label value: {}", label);
        }
        Label(label)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_reserved(&self) -> bool {
        Self::RESERVED_RANGE.contains(&self.0)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ===== impl MplsAction =====

impl MplsAction {
    // Prepends a label to this action, turning it into (or extending) a
    // `Push` stack.
    pub fn prepend(action: Option<MplsAction>, label: Label) -> MplsAction {
        match action {
            Some(MplsAction::Push(mut stack)) => {
                stack.insert(0, label);
                MplsAction::Push(stack)
            }
            None | Some(MplsAction::Php) => MplsAction::Push(vec![label]),
            Some(other) => other,
        }
    }
}

impl std::fmt::Display for MplsAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MplsAction::Push(stack) => {
                write!(f, "push ")?;
                for (pos, label) in stack.iter().enumerate() {
                    if pos != 0 {
                        write!(f, "/")?;
                    }
                    write!(f, "{}", label)?;
                }
                Ok(())
            }
            MplsAction::Swap(label) => write!(f, "swap {}", label),
            MplsAction::Php => write!(f, "php"),
            MplsAction::Pop => write!(f, "pop"),
        }
    }
}
