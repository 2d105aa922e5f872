//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::task::IntervalTask;

// How long the memory limit must stay breached before the process is
// aborted.
const MEMORY_THRESHOLD_TIME: Duration = Duration::from_secs(60);

// Last-activity marker touched by a component's event loop.
//
// Stored as milliseconds since process start so the watchdog can compare
// against a monotonic clock without locking.
#[derive(Clone, Debug, Default)]
pub struct Heartbeat(Arc<AtomicU64>);

// Process supervisor of last resort.
//
// Periodically checks that every registered component showed activity within
// the configured timeout and that resident memory stays below the limit.
// Both checks warn one full round before aborting the process.
#[derive(Debug)]
pub struct Watchdog {
    _task: IntervalTask,
}

#[derive(Debug, Default)]
struct WatchdogState {
    previous_round_ok: bool,
    mem_exceeded_since: Option<Duration>,
}

// ===== impl Heartbeat =====

impl Heartbeat {
    pub fn new() -> Heartbeat {
        let heartbeat = Heartbeat(Arc::new(AtomicU64::new(0)));
        heartbeat.touch();
        heartbeat
    }

    // Records activity. Cheap enough to call once per processed event.
    pub fn touch(&self) {
        self.0.store(uptime().as_millis() as u64, Ordering::Relaxed);
    }

    fn last(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }
}

// ===== impl Watchdog =====

impl Watchdog {
    // Starts the watchdog over the given `(name, heartbeat)` pairs.
    pub fn start(
        config: &WatchdogConfig,
        monitors: Vec<(String, Heartbeat)>,
    ) -> Watchdog {
        let interval = Duration::from_secs(config.interval_s);
        let thread_timeout = Duration::from_secs(config.thread_timeout_s);
        let max_memory_mb = config.max_memory_mb;
        let mut state = WatchdogState {
            previous_round_ok: true,
            mem_exceeded_since: None,
        };

        let task = IntervalTask::new(interval, false, move || {
            check_round(
                &mut state,
                &monitors,
                thread_timeout,
                max_memory_mb,
            );
            std::future::ready(())
        });

        Watchdog { _task: task }
    }
}

// ===== helper functions =====

// Runs one watchdog round: thread liveness then memory.
fn check_round(
    state: &mut WatchdogState,
    monitors: &[(String, Heartbeat)],
    thread_timeout: Duration,
    max_memory_mb: u64,
) {
    debug!("checking thread aliveness counters");

    let now = uptime();
    let stuck = stuck_components(now, monitors, thread_timeout);

    if !stuck.is_empty() && state.previous_round_ok {
        warn!(components = ?stuck, "waiting one more round before crashing");
    } else if !stuck.is_empty() {
        fire_crash(&format!("dead component threads detected: {:?}", stuck));
    } else if !state.previous_round_ok {
        info!("component threads seem to have recovered");
    }
    state.previous_round_ok = stuck.is_empty();

    // Memory check.
    let Some(rss_bytes) = read_rss_bytes() else {
        return;
    };
    if rss_bytes / 1_000_000 > max_memory_mb {
        warn!(%rss_bytes, limit_mb = %max_memory_mb, "memory usage critical");
        match state.mem_exceeded_since {
            None => state.mem_exceeded_since = Some(now),
            Some(since) if now - since > MEMORY_THRESHOLD_TIME => {
                fire_crash(&format!(
                    "memory limit exceeded: used {} bytes, limit {} MB",
                    rss_bytes, max_memory_mb
                ));
            }
            Some(_) => (),
        }
    } else {
        state.mem_exceeded_since = None;
    }
}

// Returns the names of components silent for longer than the timeout.
fn stuck_components(
    now: Duration,
    monitors: &[(String, Heartbeat)],
    thread_timeout: Duration,
) -> Vec<String> {
    monitors
        .iter()
        .filter(|(_, heartbeat)| {
            now.saturating_sub(heartbeat.last()) > thread_timeout
        })
        .map(|(name, _)| name.clone())
        .collect()
}

// Resident set size of this process, if the platform exposes it.
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages = statm.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(rss_pages * 4096)
}

// Monotonic time since the first call in this process.
fn uptime() -> Duration {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}

fn fire_crash(msg: &str) {
    error!("{}", msg);
    std::process::abort();
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_detection() {
        let alive = Heartbeat::new();
        let stale = Heartbeat::new();
        let monitors = vec![
            ("decision".to_owned(), alive.clone()),
            ("fib".to_owned(), stale.clone()),
        ];

        // Both fresh.
        let now = uptime();
        assert!(
            stuck_components(now, &monitors, Duration::from_secs(1))
                .is_empty()
        );

        // Pretend an hour passed and only one component kept going.
        let later = now + Duration::from_secs(3600);
        alive.0.store(later.as_millis() as u64, Ordering::Relaxed);
        let stuck =
            stuck_components(later, &monitors, Duration::from_secs(300));
        assert_eq!(stuck, vec!["fib".to_owned()]);
    }
}
