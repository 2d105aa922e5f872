//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio::{task, time};
use tracing::error;

/// A handle which can be used to manipulate the task created by the
/// [`Task::spawn`] function.
///
/// Dropping this handle cancels the task.
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
}

/// A handle which can be used to manipulate the interval task created by the
/// [`IntervalTask::new`] function.
///
/// Dropping this handle cancels the interval task.
#[derive(Debug)]
pub struct IntervalTask {
    _task: Task<()>,
    control: UnboundedSender<Duration>,
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

// ===== impl IntervalTask =====

impl IntervalTask {
    /// Spawns a new task that will call the provided async closure whenever
    /// the specified interval timer ticks.
    ///
    /// Returns a handle that can be used to manipulate the interval task.
    pub fn new<F, Fut>(
        interval: Duration,
        tick_on_start: bool,
        mut cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let task = Task::spawn(async move {
            let mut interval_fut = if tick_on_start {
                time::interval(interval)
            } else {
                time::interval_at(Instant::now() + interval, interval)
            };

            loop {
                tokio::select! {
                    // Interval timer has ticked.
                    _ = interval_fut.tick() => {
                        (cb)().await;
                    }
                    message = control_rx.recv() => {
                        match message {
                            // Interval timer has been updated.
                            Some(new_interval) => {
                                interval_fut = time::interval(new_interval);
                            }
                            // Interval timer has been aborted.
                            None => break,
                        }
                    }
                }
            }
        });

        IntervalTask {
            _task: task,
            control: control_tx,
        }
    }

    /// Resets the interval to a new value.
    pub fn reset(&mut self, interval: Duration) {
        if self.control.send(interval).is_err() {
            error!("failed to reset interval");
        }
    }
}

// ===== global functions =====

/// Sleeps until the given deadline, or forever when no deadline is set.
///
/// Designed for `tokio::select!` loops that keep an optional timer deadline
/// as plain state instead of a dedicated timer task.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
