//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tokio::sync::mpsc;

use crate::{UnboundedReceiver, UnboundedSender};

// Fan-out publisher.
//
// Every subscriber gets its own unbounded channel; published messages are
// cloned once per subscriber. Subscribers that went away are pruned on the
// next publish.
#[derive(Debug)]
pub struct ReplicateQueue<T> {
    subscribers: Vec<UnboundedSender<T>>,
}

// ===== impl ReplicateQueue =====

impl<T> ReplicateQueue<T>
where
    T: Clone,
{
    // Registers a new subscriber and returns its receiving end.
    pub fn subscribe(&mut self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    // Sends a message to all live subscribers.
    pub fn publish(&mut self, msg: T) {
        self.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<T> Default for ReplicateQueue<T> {
    fn default() -> ReplicateQueue<T> {
        ReplicateQueue {
            subscribers: Vec::new(),
        }
    }
}
