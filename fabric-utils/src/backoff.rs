//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use tokio::time::Instant;

// Exponential backoff clock.
//
// Tracks consecutive failures of a retriable operation. Every reported error
// doubles the current backoff up to the configured maximum; a reported
// success resets it. Callers are expected to gate retries on `can_try_now`
// and to use `time_remaining_until_retry` to schedule their wake-up.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    current_backoff: Duration,
    last_error_time: Option<Instant>,
}

// ===== impl ExponentialBackoff =====

impl ExponentialBackoff {
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_backoff,
            max_backoff,
            current_backoff: Duration::ZERO,
            last_error_time: None,
        }
    }

    pub fn can_try_now(&self) -> bool {
        self.time_remaining_until_retry() == Duration::ZERO
    }

    pub fn report_success(&mut self) {
        self.current_backoff = Duration::ZERO;
        self.last_error_time = None;
    }

    pub fn report_error(&mut self) {
        self.last_error_time = Some(Instant::now());
        if self.current_backoff == Duration::ZERO {
            self.current_backoff = self.initial_backoff;
        } else {
            self.current_backoff =
                std::cmp::min(self.current_backoff * 2, self.max_backoff);
        }
    }

    pub fn time_remaining_until_retry(&self) -> Duration {
        match self.last_error_time {
            None => Duration::ZERO,
            Some(last_error_time) => (last_error_time + self.current_backoff)
                .saturating_duration_since(Instant::now()),
        }
    }
}
