// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runplane Engine - Runnable Lifecycle & Reconciliation
//!
//! This crate is the control plane that executes submitted jobs ("runs") as
//! workloads on a backend, tracks their state and reconciles it as the
//! backend reports progress, completion or failure. Container jobs,
//! services and scheduled pipelines all go through one lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             Callers                                      │
//! │                 (API layer, schedule actuator)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ run / stop / resume / delete
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       RunLifecycleManager                                │
//! │            (only writer of run status, mirrors runnables)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ RuntimeFactory                          ▲ RunnableChanged
//!           ▼                                         │ (broadcast)
//! ┌───────────────────┐   Dispatcher (mpsc)   ┌───────┴───────────────────┐
//! │  Runtime (kind)   │──────────────────────►│   Listener (type tag)     │
//! │  container, ...   │   persist + enqueue   │  run / stop / delete      │
//! └───────────────────┘                       └───────────┬───────────────┘
//!                                                         │
//!                          ┌──────────────────────────────▼──────────────┐
//!                          │          Framework (type tag)               │
//!                          │     process, mock, cluster backends         │
//!                          └──────┬─────────────────────────────▲────────┘
//!                    ResourceEvent│                             │ refresh
//!                                 ▼                             │
//!                          ┌─────────────┐  reconcile   ┌───────┴───────┐
//!                          │   Watcher   │─────────────►│    Monitor    │◄── Poller
//!                          └─────────────┘              └───────┬───────┘
//!                                                               │
//!                                                               ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                  RunnableStore (SQLite / PostgreSQL)                   │
//! │                    runnables (id, kind) → payload                      │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! | State | Meaning |
//! |-------|---------|
//! | `READY` | created, waiting for the listener |
//! | `RUNNING` | backend resource executing |
//! | `COMPLETED` | backend reported success |
//! | `ERROR` | backend or operation failure |
//! | `STOP` / `STOPPED` | stop requested / confirmed |
//! | `RESUME` | resume requested from `STOPPED` |
//! | `DELETING` / `DELETED` | deletion requested / confirmed (row removed) |
//!
//! # Configuration
//!
//! The binary loads its configuration from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNPLANE_DATABASE_URL` | Yes | - | `sqlite:` or `postgres:` connection string |
//! | `RUNPLANE_DATA_DIR` | No | `.data` | Working area of the process backend |
//! | `RUNPLANE_NAMESPACE` | No | `default` | Namespace watched and populated |
//! | `RUNPLANE_MONITOR_DELAY_SECS` | No | `60` | Delay between monitor cycles |
//! | `RUNPLANE_LISTENER_CONCURRENCY` | No | `8` | In-flight listener operations |
//! | `RUNPLANE_EVENT_CAPACITY` | No | `1024` | Change bus capacity |
//!
//! # Modules
//!
//! - [`runtime`]: Embeddable engine assembling every component
//! - [`lifecycle`]: Run lifecycle manager and run repositories
//! - [`runtimes`]: Run-kind strategies (container runtime)
//! - [`registry`]: Runtime and actuator factories
//! - [`actuator`]: Triggers and the schedule actuator
//! - [`listener`]: Execution of pending requests, dispatcher
//! - [`monitor`]: State refresh from backend observations
//! - [`watcher`]: Event-driven reconciliation
//! - [`framework`]: Backend abstraction (process, mock)
//! - [`store`]: Runnable persistence
//! - [`poller`]: Recurring workflows and the polling service

#![deny(missing_docs)]

/// Database migrations for the runnable store.
///
/// ```ignore
/// use runplane_engine::migrations;
///
/// let pool = SqlitePool::connect("sqlite:runplane.db?mode=rwc").await?;
/// migrations::run_sqlite(&pool).await?;
/// ```
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Lifecycle states and the transition lattice.
pub mod state;

/// Runs and the entities they reference.
pub mod run;

/// Runnables: execution descriptors with live state.
pub mod runnable;

/// Runnable change notifications.
pub mod events;

/// Persistent, per type tag runnable storage.
pub mod store;

/// Backend abstraction and reference backends.
pub mod framework;

/// State refresh from backend observations.
pub mod monitor;

/// Event-driven reconciliation.
pub mod watcher;

/// Execution of pending state-transition requests.
pub mod listener;

/// Run-kind strategies.
pub mod runtimes;

/// Kind-keyed factories for runtimes and actuators.
pub mod registry;

/// Triggers and actuators.
pub mod actuator;

/// Run lifecycle management.
pub mod lifecycle;

/// Recurring workflows and the polling service.
pub mod poller;

/// Embeddable engine runtime.
pub mod runtime;

pub use config::Config;
pub use error::Error;
