//! # Connection State Machine
//!
//! Table-driven lifecycle of the BLE link. Transitions not listed in the
//! table are rejected: the call returns `false` and the state is unchanged.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Disconnected | Connect | Connecting |
//! | Connecting | ConnectSuccess | Connected |
//! | Connecting | ConnectFailed | Failed |
//! | Connected | Disconnect | Disconnected |
//! | Connected | ConnectionLost | Reconnecting |
//! | Failed | Retry | Backoff |
//! | Backoff | BackoffExpired | Connecting |
//! | Reconnecting | Retry | Connecting |
//!
//! [`ConnectionStateMachine::force_state`] bypasses the table for recovery
//! paths the table does not model (a loss reported while still connecting).

use std::fmt;

use tracing::{debug, warn};

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Backoff,
}

impl ConnectionState {
    /// States from which a connection attempt may start.
    #[inline]
    pub fn can_connect(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::Failed
                | ConnectionState::Backoff
                | ConnectionState::Reconnecting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connect,
    ConnectSuccess,
    ConnectFailed,
    Disconnect,
    ConnectionLost,
    Retry,
    BackoffExpired,
}

const TRANSITIONS: &[(ConnectionState, ConnectionEvent, ConnectionState)] = {
    use ConnectionEvent as E;
    use ConnectionState as S;
    &[
        (S::Disconnected, E::Connect, S::Connecting),
        (S::Connecting, E::ConnectSuccess, S::Connected),
        (S::Connecting, E::ConnectFailed, S::Failed),
        (S::Connected, E::Disconnect, S::Disconnected),
        (S::Connected, E::ConnectionLost, S::Reconnecting),
        (S::Failed, E::Retry, S::Backoff),
        (S::Backoff, E::BackoffExpired, S::Connecting),
        (S::Reconnecting, E::Retry, S::Connecting),
    ]
};

/// Target state of `(state, event)`, if the table allows it.
pub fn next_state(state: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    TRANSITIONS
        .iter()
        .find(|(from, ev, _)| *from == state && *ev == event)
        .map(|(_, _, to)| *to)
}

/// Current state plus transition bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    previous: Option<ConnectionState>,
    transitions: u64,
    rejected: u64,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn previous(&self) -> Option<ConnectionState> {
        self.previous
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[inline]
    pub fn can_connect(&self) -> bool {
        self.state.can_connect()
    }

    /// (accepted, rejected) transition counts.
    #[inline]
    pub fn counts(&self) -> (u64, u64) {
        (self.transitions, self.rejected)
    }

    /// Apply `event`; returns false (state unchanged) if the table forbids it.
    pub fn transition(&mut self, event: ConnectionEvent) -> bool {
        match next_state(self.state, event) {
            Some(to) => {
                debug!("Connection state: {} --{:?}--> {}", self.state, event, to);
                self.previous = Some(self.state);
                self.state = to;
                self.transitions += 1;
                true
            }
            None => {
                warn!("Invalid transition: {:?} in state {}", event, self.state);
                self.rejected += 1;
                false
            }
        }
    }

    /// Set the state directly, bypassing the table.
    pub fn force_state(&mut self, state: ConnectionState) {
        if state != self.state {
            warn!("Forcing connection state {} -> {}", self.state, state);
            self.previous = Some(self.state);
            self.state = state;
        }
    }

    /// Back to Disconnected, clearing history.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
