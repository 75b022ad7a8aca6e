//! Server lifecycle state machine.

use chrono::{DateTime, Utc};
use hsu_common::{Error, Result};
use std::collections::VecDeque;
use std::fmt;

const MAX_HISTORY: usize = 32;

/// Lifecycle state of a [`NameServer`](crate::NameServer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Not serving. Initial and terminal state.
    Stopped,
    /// Binding transports and spawning the worker.
    Starting,
    /// Worker is serving requests.
    Running,
    /// Stop requested; worker is finishing its current cycle.
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from_state: ServerState,
    pub to_state: ServerState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Validated transitions with a bounded history.
#[derive(Debug, Clone)]
pub struct ServerStateMachine {
    current_state: ServerState,
    history: VecDeque<StateTransition>,
}

impl Default for ServerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: ServerState::Stopped,
            history: VecDeque::new(),
        }
    }

    pub fn current_state(&self) -> ServerState {
        self.current_state
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn is_valid_transition(&self, target: ServerState) -> bool {
        use ServerState::*;

        match (self.current_state, target) {
            (Stopped, Starting) => true,
            (Starting, Running) => true,
            (Starting, Stopped) => true, // bind failure
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            // Same state (no-op)
            (state, target) if state == target => true,
            _ => false,
        }
    }

    /// Moves to `target`, recording why.
    pub fn transition_to(&mut self, target: ServerState, reason: impl Into<String>) -> Result<()> {
        if !self.is_valid_transition(target) {
            return Err(Error::internal(format!(
                "invalid server state transition {} -> {}",
                self.current_state, target
            )));
        }
        if self.current_state == target {
            return Ok(());
        }

        let transition = StateTransition {
            from_state: self.current_state,
            to_state: target,
            timestamp: Utc::now(),
            reason: Some(reason.into()),
        };

        tracing::info!(from = %transition.from_state, to = %target, "Name server state changed");

        self.current_state = target;
        self.history.push_back(transition);
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }

        Ok(())
    }

    /// Walks whatever path is valid from the current state down to Stopped.
    ///
    /// Used by teardown paths that must end in Stopped no matter where they
    /// start.
    pub fn settle_stopped(&mut self, reason: &str) {
        if self.current_state == ServerState::Running {
            let _ = self.transition_to(ServerState::Stopping, reason);
        }
        let _ = self.transition_to(ServerState::Stopped, reason);
    }
}
