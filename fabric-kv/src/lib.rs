//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod client;
pub mod error;

pub use client::{Counters, KeyCallback, KvStoreClient, KvStoreClientHandle};
pub use error::Error;
