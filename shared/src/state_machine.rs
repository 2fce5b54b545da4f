//! Link State Machine
//!
//! Defines the connection lifecycle of the peripheral and the only valid
//! transitions between its states.

use std::fmt;
use thiserror::Error;

/// Connection state of the peripheral link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Manager task started
    Started,
    /// A scan returned a device matching the filter
    DeviceFound,
    /// A scan returned nothing usable (or faulted)
    NoDeviceFound,
    /// Connect and notification subscribe both succeeded
    LinkEstablished,
    /// Connect or subscribe failed
    LinkFailed,
    /// The adapter reported loss of the current link
    LinkLost,
    /// Reconnection loop begins
    ReconnectStarted,
}

/// Rejected transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: LinkEvent,
}

/// The link state machine
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: ConnectionState,
}

impl LinkStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Process an event; on success the new state is returned
    ///
    /// Invalid transitions leave the state untouched.
    pub fn process_event(&mut self, event: LinkEvent) -> Result<ConnectionState, TransitionError> {
        match next_state(self.current_state, event) {
            Some(state) => {
                self.current_state = state;
                Ok(state)
            }
            None => Err(TransitionError {
                from: self.current_state,
                event,
            }),
        }
    }
}

/// Get the next state for a given event, if the transition is valid
fn next_state(from: ConnectionState, event: LinkEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use LinkEvent::*;

    match (from, event) {
        (Idle, Started) => Some(Scanning),

        (Scanning, DeviceFound) => Some(Connecting),
        (Scanning, NoDeviceFound) => Some(Scanning),

        (Connecting, LinkEstablished) => Some(Connected),
        (Connecting, LinkFailed) => Some(Scanning),

        (Connected, LinkLost) => Some(Disconnected),

        (Disconnected, ReconnectStarted) => Some(Scanning),

        _ => None,
    }
}

/// Check if a transition from one state to another is an edge of the lifecycle
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (from, to),
        (Idle, Scanning)
            | (Scanning, Connecting)
            | (Scanning, Scanning)
            | (Connecting, Connected)
            | (Connecting, Scanning)
            | (Connected, Disconnected)
            | (Disconnected, Scanning)
    )
}
