// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runnable change notifications.
//!
//! Listeners and monitors publish a [`RunnableChanged`] whenever they write a
//! runnable; the lifecycle manager (and any other subscriber) consumes them.
//! Publishing never blocks: the bus is a bounded broadcast ring, slow
//! receivers observe `RecvError::Lagged` and skip the oldest events.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::runnable::Runnable;
use crate::state::State;

/// A runnable was written by a listener or a monitor.
#[derive(Debug, Clone)]
pub struct RunnableChanged {
    /// State before the write
    pub previous: State,
    /// Runnable after the write
    pub runnable: Runnable,
    /// When the change was observed
    pub at: DateTime<Utc>,
}

impl RunnableChanged {
    /// Create a change event stamped now.
    pub fn new(previous: State, runnable: Runnable) -> Self {
        Self {
            previous,
            runnable,
            at: Utc::now(),
        }
    }

    /// Whether the state moved.
    pub fn is_transition(&self) -> bool {
        self.previous != self.runnable.state
    }
}

/// Broadcast bus for [`RunnableChanged`] events.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RunnableChanged>,
}

impl EventBus {
    /// Create a bus with the given capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: RunnableChanged) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnableChanged> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let mut runnable = Runnable::new("run-1", "demo", "container", "job", "mock");
        runnable.state = State::Running;
        bus.publish(RunnableChanged::new(State::Ready, runnable));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.previous, State::Ready);
        assert_eq!(event.runnable.state, State::Running);
        assert!(event.is_transition());
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(0);
        let runnable = Runnable::new("run-1", "demo", "container", "job", "mock");
        bus.publish(RunnableChanged::new(State::Ready, runnable));
    }
}
