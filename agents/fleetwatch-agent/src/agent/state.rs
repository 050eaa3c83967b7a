//! Connection State Management
//!
//! Provides the connection state machine and the manager that owns it. Only
//! the connection supervisor mutates the state; every other component holds a
//! [`StateObserver`] and reads.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Represents the connectivity of the agent to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable transport
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Transport is open and authenticated
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// State transition information
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Internal state data
struct StateInner {
    current: ConnectionState,
    last_connected: Option<DateTime<Utc>>,
    connection_attempts: u32,
    transitions: Vec<StateTransition>,
}

/// Connection state manager, held by the supervisor
pub struct ConnectionStateManager {
    inner: RwLock<StateInner>,
    notify: watch::Sender<ConnectionState>,
}

/// Read-only view of the connection state handed to runners and the dispatcher
#[derive(Clone)]
pub struct StateObserver {
    rx: watch::Receiver<ConnectionState>,
}

impl ConnectionStateManager {
    /// Create a new state manager starting in Disconnected state
    pub fn new() -> Self {
        let (notify, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: RwLock::new(StateInner {
                current: ConnectionState::Disconnected,
                last_connected: None,
                connection_attempts: 0,
                transitions: Vec::new(),
            }),
            notify,
        }
    }

    /// Get the current state
    pub fn current_state(&self) -> ConnectionState {
        self.inner.read().current
    }

    /// Get the last connected timestamp
    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_connected
    }

    /// Number of connect attempts since the last successful connection
    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    /// New observer of this state
    pub fn observer(&self) -> StateObserver {
        StateObserver {
            rx: self.notify.subscribe(),
        }
    }

    /// Transition to a new state. Returns false when the transition is not
    /// allowed; self transitions are accepted but do not notify observers.
    pub fn transition_to(&self, new_state: ConnectionState, reason: Option<String>) -> bool {
        let mut inner = self.inner.write();

        if !Self::is_valid_transition(inner.current, new_state) {
            tracing::warn!(
                from = %inner.current,
                to = %new_state,
                "Rejected connection state transition"
            );
            return false;
        }

        let old_state = inner.current;
        if old_state == new_state {
            return true;
        }

        inner.current = new_state;
        match new_state {
            ConnectionState::Connected => {
                inner.last_connected = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            ConnectionState::Connecting => {
                inner.connection_attempts += 1;
            }
            ConnectionState::Disconnected => {}
        }

        inner.transitions.push(StateTransition {
            from: old_state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });

        // Keep only last 100 transitions
        if inner.transitions.len() > 100 {
            inner.transitions.remove(0);
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            attempts = inner.connection_attempts,
            "Connection state transition"
        );

        // Never blocks; observers only ever see the latest value.
        self.notify.send_replace(new_state);
        true
    }

    fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
        if from == to {
            return true;
        }

        matches!(
            (from, to),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Disconnected, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }

    pub fn set_connecting(&self) {
        self.transition_to(ConnectionState::Connecting, Some("Initiating connection".to_string()));
    }

    pub fn set_connected(&self) {
        self.transition_to(ConnectionState::Connected, Some("Connection established".to_string()));
    }

    pub fn set_disconnected(&self, reason: Option<String>) {
        self.transition_to(ConnectionState::Disconnected, reason);
    }

    /// Get recent state transitions, newest first
    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        let inner = self.inner.read();
        inner.transitions.iter().rev().take(count).cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateObserver {
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Wait for the next state change. Returns `None` once the manager is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Edge detector for the supervisor's liveness check.
///
/// Reports a value only when the observed liveness differs from the last one
/// seen, so a steady connection does not produce a notification every poll.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    last: bool,
}

impl LivenessTracker {
    pub fn new(initial: bool) -> Self {
        Self { last: initial }
    }

    /// Record a liveness result; returns the new value on an edge.
    pub fn observe(&mut self, alive: bool) -> Option<bool> {
        if alive == self.last {
            return None;
        }
        self.last = alive;
        Some(alive)
    }

    pub fn last(&self) -> bool {
        self.last
    }
}

/// Shared ownership helper used when wiring the agent
pub type SharedStateManager = Arc<ConnectionStateManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let manager = ConnectionStateManager::new();
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(!manager.observer().is_connected());
    }

    #[test]
    fn test_valid_transitions() {
        let manager = ConnectionStateManager::new();

        assert!(manager.transition_to(ConnectionState::Connecting, None));
        assert!(manager.transition_to(ConnectionState::Connected, None));
        assert!(manager.transition_to(ConnectionState::Disconnected, None));
        assert_eq!(manager.recent_transitions(10).len(), 3);
    }

    #[test]
    fn test_connected_must_drop_before_connecting() {
        let manager = ConnectionStateManager::new();
        let observer = manager.observer();
        manager.set_connecting();
        manager.set_connected();

        assert!(!manager.transition_to(ConnectionState::Connecting, None));
        assert_eq!(manager.current_state(), ConnectionState::Connected);
        assert_eq!(observer.current(), ConnectionState::Connected);
        assert_eq!(manager.recent_transitions(10).len(), 2);

        assert!(manager.transition_to(ConnectionState::Disconnected, None));
        assert!(manager.transition_to(ConnectionState::Connecting, None));
    }

    #[test]
    fn test_connection_attempts() {
        let manager = ConnectionStateManager::new();

        manager.set_connecting();
        assert_eq!(manager.connection_attempts(), 1);

        manager.set_disconnected(None);
        manager.set_connecting();
        assert_eq!(manager.connection_attempts(), 2);

        manager.set_connected();
        assert_eq!(manager.connection_attempts(), 0);
        assert!(manager.last_connected().is_some());
    }

    #[tokio::test]
    async fn test_observer_sees_latest_state() {
        let manager = ConnectionStateManager::new();
        let mut observer = manager.observer();

        manager.set_connecting();
        manager.set_connected();

        // Intermediate Connecting is coalesced away.
        assert_eq!(observer.changed().await, Some(ConnectionState::Connected));
        assert!(observer.is_connected());
    }

    #[test]
    fn test_liveness_tracker_is_edge_triggered() {
        let mut tracker = LivenessTracker::new(false);
        let edges: Vec<bool> = [true, true, false, false, true]
            .into_iter()
            .filter_map(|alive| tracker.observe(alive))
            .collect();
        // false -> true, true -> false, false -> true
        assert_eq!(edges, vec![true, false, true]);

        let mut tracker = LivenessTracker::new(true);
        let edges: Vec<bool> = [true, true, false, false, true]
            .into_iter()
            .filter_map(|alive| tracker.observe(alive))
            .collect();
        assert_eq!(edges, vec![false, true]);
    }
}
