//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use fabric_utils::agent::AgentError;
use tracing::warn;

// FIB programmer errors.
#[derive(Debug)]
pub enum Error {
    // An agent RPC failed. Recovery is the debounced full resync; the
    // programmer never gives up while running.
    Agent(AgentError),
    // The component's event loop is no longer running.
    FibStopped,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::Agent(error) => {
                warn!(%error, "{}", self);
            }
            Error::FibStopped => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Agent(..) => {
                write!(f, "forwarding agent request failed")
            }
            Error::FibStopped => {
                write!(f, "FIB programmer is stopped")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Agent(error) => Some(error),
            Error::FibStopped => None,
        }
    }
}

impl From<AgentError> for Error {
    fn from(error: AgentError) -> Error {
        Error::Agent(error)
    }
}
