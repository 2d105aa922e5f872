//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod error;
pub mod fib;

pub use error::Error;
pub use fib::{Counters, Fib, FibHandle, longest_prefix_match};
