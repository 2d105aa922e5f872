//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use fabric_utils::mpls::Label;
use ipnetwork::IpNetwork;
use tracing::{error, warn};

// Decision engine errors.
#[derive(Debug)]
pub enum Error {
    // Protocol errors: the offending item is dropped, processing continues.
    UnknownArea(String),
    AnnouncementFromUnknownNode(String, String),
    DuplicateStaticRoute(IpNetwork),
    DuplicateLabelRoute(Label),
    PayloadDecodeError(String, serde_json::Error),
    // Resource errors: reported, the affected prefix yields no route.
    PrependLabelExhausted(IpNetwork),
    // The downstream FIB queue went away. Hard error.
    FibQueueClosed,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::UnknownArea(area) => {
                warn!(%area, "{}", self);
            }
            Error::AnnouncementFromUnknownNode(node, area) => {
                warn!(%node, %area, "{}", self);
            }
            Error::DuplicateStaticRoute(prefix) => {
                warn!(%prefix, "{}", self);
            }
            Error::DuplicateLabelRoute(label) => {
                warn!(%label, "{}", self);
            }
            Error::PayloadDecodeError(key, error) => {
                warn!(%key, %error, "{}", self);
            }
            Error::PrependLabelExhausted(prefix) => {
                error!(%prefix, "{}", self);
            }
            Error::FibQueueClosed => {
                error!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownArea(..) => {
                write!(f, "announcement in unknown area")
            }
            Error::AnnouncementFromUnknownNode(..) => {
                write!(f, "announcement from node absent in area topology")
            }
            Error::DuplicateStaticRoute(..) => {
                write!(f, "duplicate static route")
            }
            Error::DuplicateLabelRoute(..) => {
                write!(f, "duplicate label route")
            }
            Error::PayloadDecodeError(..) => {
                write!(f, "failed to decode KV payload")
            }
            Error::PrependLabelExhausted(..) => {
                write!(f, "prepend label space exhausted")
            }
            Error::FibQueueClosed => {
                write!(f, "FIB update queue closed")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::PayloadDecodeError(_, error) => Some(error),
            _ => None,
        }
    }
}
