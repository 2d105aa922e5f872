//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use fabric_utils::kv::KvStoreError;
use tracing::warn;

// KV client errors.
#[derive(Debug)]
pub enum Error {
    // A store RPC failed. Advertisement failures are retried with per-key
    // backoff; read failures surface to the caller.
    Store(KvStoreError),
    // The client's event loop is no longer running.
    ClientStopped,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::Store(error) => {
                warn!(%error, "{}", self);
            }
            Error::ClientStopped => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Store(..) => {
                write!(f, "KV store request failed")
            }
            Error::ClientStopped => {
                write!(f, "KV client is stopped")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(error) => Some(error),
            Error::ClientStopped => None,
        }
    }
}

impl From<KvStoreError> for Error {
    fn from(error: KvStoreError) -> Error {
        Error::Store(error)
    }
}
