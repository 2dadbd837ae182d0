// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle state shared by runnables and runs.
//!
//! ```text
//!      ┌───────┐  run   ┌─────────┐ succeeded ┌───────────┐
//!      │ READY │───────►│ RUNNING │──────────►│ COMPLETED │
//!      └───▲───┘        └────┬────┘           └───────────┘
//!          │                 │ failed         ┌───────────┐
//!   resume │                 └───────────────►│   ERROR   │
//!          │                                  └───────────┘
//!     ┌────┴────┐  stop   ┌──────┐
//!     │ STOPPED │◄────────│ STOP │◄──── (any non-terminal state)
//!     └─────────┘         └──────┘
//!
//!     (any state) ──► DELETING ──► DELETED (removed from store)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a runnable (and, mirrored, of its run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created, waiting for the listener to launch it.
    Ready,
    /// Backend resource exists and is executing.
    Running,
    /// Backend reported success.
    Completed,
    /// Backend reported failure, or an operation on it failed.
    Error,
    /// Stop requested.
    Stop,
    /// Stopped; may be resumed.
    Stopped,
    /// Resume requested.
    Resume,
    /// Deletion requested.
    Deleting,
    /// Deleted; removed from its store.
    Deleted,
}

impl State {
    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Ready => "READY",
            State::Running => "RUNNING",
            State::Completed => "COMPLETED",
            State::Error => "ERROR",
            State::Stop => "STOP",
            State::Stopped => "STOPPED",
            State::Resume => "RESUME",
            State::Deleting => "DELETING",
            State::Deleted => "DELETED",
        }
    }

    /// Stable rest states: nothing moves them except an explicit new request.
    pub fn is_rest(&self) -> bool {
        matches!(
            self,
            State::Completed | State::Error | State::Stopped | State::Deleted
        )
    }

    /// States that carry a pending request for a listener.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            State::Ready | State::Stop | State::Resume | State::Deleting
        )
    }

    /// Whether a write moving from `self` to `next` is allowed.
    ///
    /// Self-transitions are always allowed so that repeated writes stay idempotent.
    pub fn can_transition_to(&self, next: State) -> bool {
        use State::*;

        if *self == next {
            return true;
        }

        match self {
            Ready => matches!(next, Running | Error | Stop | Deleting | Deleted),
            Running => matches!(
                next,
                Completed | Error | Stop | Stopped | Deleting | Deleted
            ),
            Stop => matches!(next, Stopped | Error | Deleting | Deleted),
            Stopped => matches!(next, Resume | Ready | Deleting | Deleted),
            Resume => matches!(next, Ready | Running | Error | Deleting | Deleted),
            Completed | Error => matches!(next, Deleting | Deleted),
            Deleting => matches!(next, Deleted | Error),
            Deleted => false,
        }
    }

    /// Whether an observed state may be mirrored from `self` to `next`.
    ///
    /// Like [`can_transition_to`](Self::can_transition_to), but a run still
    /// waiting to launch may jump to a completion it never saw running.
    pub fn can_advance_to(&self, next: State) -> bool {
        self.can_transition_to(next)
            || (matches!(self, State::Ready | State::Resume) && next == State::Completed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READY" => Ok(State::Ready),
            "RUNNING" => Ok(State::Running),
            "COMPLETED" => Ok(State::Completed),
            "ERROR" => Ok(State::Error),
            "STOP" => Ok(State::Stop),
            "STOPPED" => Ok(State::Stopped),
            "RESUME" => Ok(State::Resume),
            "DELETING" => Ok(State::Deleting),
            "DELETED" => Ok(State::Deleted),
            other => Err(crate::error::Error::InvalidArgument(format!(
                "unknown state '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(State::Ready.can_transition_to(State::Running));
        assert!(State::Running.can_transition_to(State::Completed));
        assert!(State::Running.can_transition_to(State::Error));
        assert!(State::Running.can_transition_to(State::Stop));
        assert!(State::Stop.can_transition_to(State::Stopped));
        assert!(State::Stopped.can_transition_to(State::Resume));
        assert!(State::Resume.can_transition_to(State::Running));
    }

    #[test]
    fn test_rest_states_only_leave_through_requests() {
        for rest in [State::Completed, State::Error] {
            assert!(!rest.can_transition_to(State::Running));
            assert!(!rest.can_transition_to(State::Stop));
            assert!(rest.can_transition_to(State::Deleting));
        }
        assert!(!State::Stopped.can_transition_to(State::Running));
        assert!(!State::Stopped.can_transition_to(State::Completed));
    }

    #[test]
    fn test_deleted_is_terminal() {
        for next in [State::Ready, State::Running, State::Error, State::Deleting] {
            assert!(!State::Deleted.can_transition_to(next));
        }
        assert!(State::Deleted.can_transition_to(State::Deleted));
    }

    #[test]
    fn test_self_transition_is_allowed() {
        assert!(State::Completed.can_transition_to(State::Completed));
        assert!(State::Stop.can_transition_to(State::Stop));
    }

    #[test]
    fn test_advance_skips_unseen_running() {
        assert!(State::Ready.can_advance_to(State::Completed));
        assert!(State::Resume.can_advance_to(State::Completed));
        assert!(State::Ready.can_advance_to(State::Error));
        assert!(!State::Completed.can_advance_to(State::Running));
        assert!(!State::Stop.can_advance_to(State::Running));
        assert!(!State::Stopped.can_advance_to(State::Completed));
    }

    #[test]
    fn test_serde_uses_upper_case() {
        let json = serde_json::to_string(&State::Deleting).unwrap();
        assert_eq!(json, "\"DELETING\"");
        let parsed: State = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(parsed, State::Stopped);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("running".parse::<State>().unwrap(), State::Running);
        assert!("paused".parse::<State>().is_err());
    }
}
