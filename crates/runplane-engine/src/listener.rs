// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution of pending state-transition requests.
//!
//! Runtimes never call a framework directly. They hand a runnable carrying
//! the requested state to the [`Dispatcher`], which persists the request and
//! routes it over an mpsc channel to the [`Listener`] for the runnable's type
//! tag. The listener performs the framework operation on a worker task,
//! persists the outcome and publishes a [`RunnableChanged`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, RunnableChanged};
use crate::framework::Framework;
use crate::runnable::Runnable;
use crate::state::State;
use crate::store::RunnableStore;

/// Handles pending runnables of one type tag.
#[derive(Clone)]
pub struct Listener {
    framework: Arc<dyn Framework>,
    store: RunnableStore,
    events: EventBus,
    permits: Arc<Semaphore>,
}

impl Listener {
    /// Create a listener running at most `concurrency` operations at once.
    pub fn new(
        framework: Arc<dyn Framework>,
        store: RunnableStore,
        events: EventBus,
        concurrency: usize,
    ) -> Self {
        Self {
            framework,
            store,
            events,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Type tag served by this listener.
    pub fn kind(&self) -> &str {
        self.store.kind()
    }

    /// Execute one pending runnable and return the outcome.
    ///
    /// Never fails: backend errors turn into an ERROR runnable, persistence
    /// errors are logged. The outcome is written only while the stored
    /// runnable still carries the handled request; otherwise it is discarded
    /// unpublished, and a resource it launched is stopped or deleted to match
    /// the newer request.
    pub async fn handle(&self, runnable: Runnable) -> Runnable {
        let previous = runnable.state;
        let id = runnable.id.clone();

        let outcome = match previous {
            State::Ready | State::Resume => self.framework.run(runnable.clone()).await,
            State::Stop => self.framework.stop(runnable.clone()).await,
            State::Deleting => self.framework.delete(runnable.clone()).await,
            _ => {
                debug!(runnable_id = %id, state = %previous, "Nothing to do for state");
                return runnable;
            }
        };
        let launched = matches!(previous, State::Ready | State::Resume) && outcome.is_ok();

        let updated = match outcome {
            Ok(updated) => updated,
            Err(e) => {
                warn!(runnable_id = %id, state = %previous, error = %e, "Backend operation failed");
                let mut failed = runnable;
                failed.fail(e.to_string());
                failed
            }
        };

        match self.persist(previous, &updated).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    runnable_id = %id,
                    from = %previous,
                    to = %updated.state,
                    "Request superseded, discarding outcome"
                );
                if launched {
                    self.release(&updated).await;
                }
                return updated;
            }
            Err(e) => {
                error!(
                    runnable_id = %id,
                    state = %updated.state,
                    error = %e,
                    "Failed to persist runnable"
                );
            }
        }

        info!(
            runnable_id = %id,
            kind = %self.kind(),
            from = %previous,
            to = %updated.state,
            "Runnable transitioned"
        );
        self.events
            .publish(RunnableChanged::new(previous, updated.clone()));
        updated
    }

    /// Write the outcome if the stored runnable is still in `previous`.
    ///
    /// DELETED removes the row; a row that is already gone counts as written.
    async fn persist(&self, previous: State, updated: &Runnable) -> Result<bool> {
        if updated.state == State::Deleted {
            let removed = self
                .store
                .remove_if(&updated.id, |stored| stored.state == previous)
                .await?;
            return Ok(removed || self.store.find(&updated.id).await?.is_none());
        }

        let next = updated.clone();
        let written = self
            .store
            .update(&updated.id, move |stored| {
                if stored.state != previous || !previous.can_transition_to(next.state) {
                    return false;
                }
                *stored = next;
                true
            })
            .await?;
        Ok(written.is_some())
    }

    /// Bring a resource launched by a superseded request in line with the
    /// request that replaced it.
    async fn release(&self, launched: &Runnable) {
        let current = match self.store.find(&launched.id).await {
            Ok(current) => current.map(|r| r.state),
            Err(e) => {
                error!(runnable_id = %launched.id, error = %e, "Failed to read runnable");
                return;
            }
        };

        let released = match current {
            None | Some(State::Deleting) => self.framework.delete(launched.clone()).await,
            Some(State::Stop) | Some(State::Stopped) => self.framework.stop(launched.clone()).await,
            Some(_) => return,
        };
        match released {
            Ok(r) => info!(runnable_id = %launched.id, state = %r.state, "Released superseded resource"),
            Err(e) => error!(
                runnable_id = %launched.id,
                error = %e,
                "Failed to release superseded resource"
            ),
        }
    }

    /// Consume pending runnables until shutdown or until every sender is gone.
    ///
    /// In-flight operations are awaited before returning.
    pub async fn run(self, mut pending: mpsc::Receiver<Runnable>, shutdown: Arc<Notify>) {
        info!(kind = %self.kind(), "Listener started");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    info!(kind = %self.kind(), "Listener shutting down");
                    break;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(kind = %self.kind(), error = %e, "Listener task panicked");
                    }
                }

                received = pending.recv() => {
                    let Some(runnable) = received else {
                        debug!(kind = %self.kind(), "Pending channel closed");
                        break;
                    };
                    let Ok(permit) = self.permits.clone().acquire_owned().await else {
                        break;
                    };
                    let listener = self.clone();
                    tasks.spawn(async move {
                        listener.handle(runnable).await;
                        drop(permit);
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(kind = %self.kind(), error = %e, "Listener task panicked");
            }
        }
    }
}

struct Route {
    store: RunnableStore,
    sender: mpsc::Sender<Runnable>,
}

/// Routes pending runnables to the listener for their type tag.
#[derive(Default)]
pub struct Dispatcher {
    routes: HashMap<String, Route>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route for the store's type tag.
    ///
    /// Returns the receiving end for the listener.
    pub fn route(
        &mut self,
        store: RunnableStore,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Runnable>> {
        let kind = store.kind().to_string();
        if self.routes.contains_key(&kind) {
            return Err(Error::DuplicateKind(kind));
        }
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.routes.insert(kind, Route { store, sender });
        Ok(receiver)
    }

    /// Store for a type tag.
    pub fn store(&self, kind: &str) -> Option<&RunnableStore> {
        self.routes.get(kind).map(|r| &r.store)
    }

    /// Stores of all routed type tags.
    pub fn stores(&self) -> impl Iterator<Item = &RunnableStore> {
        self.routes.values().map(|r| &r.store)
    }

    /// Persist a pending request and enqueue it for its listener.
    pub async fn dispatch(&self, runnable: Runnable) -> Result<()> {
        let route = self.lookup(&runnable.framework)?;
        route.store.request(&runnable).await?;
        self.send(route, runnable).await
    }

    /// Enqueue an already persisted request (e.g. recovered at startup).
    pub async fn enqueue(&self, runnable: Runnable) -> Result<()> {
        let route = self.lookup(&runnable.framework)?;
        self.send(route, runnable).await
    }

    fn lookup(&self, kind: &str) -> Result<&Route> {
        self.routes
            .get(kind)
            .ok_or_else(|| Error::not_found("Listener", kind))
    }

    async fn send(&self, route: &Route, runnable: Runnable) -> Result<()> {
        debug!(
            runnable_id = %runnable.id,
            kind = %runnable.framework,
            state = %runnable.state,
            "Dispatching pending runnable"
        );
        route.sender.send(runnable).await.map_err(|e| {
            Error::Other(format!(
                "listener for '{}' is not running",
                e.0.framework
            ))
        })
    }
}
