//! ---
//! m2c_section: "04-configuration-orchestration"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Connection state machine shared by the control handler and polling task."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use m2c_metrics::ConnectorMetrics;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of one connection.
///
/// `idle -> connecting -> running <-> reconnecting -> stopping -> idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
}

impl ConnectionState {
    /// Value exported on the `m2c_connection_state` gauge.
    pub fn code(self) -> i64 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Running => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Stopping => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Running => "running",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopping => "stopping",
        }
    }

    /// The device session is (or is being) held.
    pub fn is_active(self) -> bool {
        !matches!(self, ConnectionState::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state cell; every transition is mirrored on the metrics gauge.
#[derive(Clone)]
pub struct StateHandle {
    connection: Arc<str>,
    tx: Arc<watch::Sender<ConnectionState>>,
    metrics: Option<ConnectorMetrics>,
}

impl fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("connection", &self.connection)
            .field("state", &self.get())
            .finish()
    }
}

impl StateHandle {
    pub fn new(connection: &str, metrics: Option<ConnectorMetrics>) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Idle);
        if let Some(metrics) = &metrics {
            metrics.set_state(connection, ConnectionState::Idle.code());
        }
        Self {
            connection: Arc::from(connection),
            tx: Arc::new(tx),
            metrics,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn set(&self, next: ConnectionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!(connection = %self.connection, from = %previous, to = %next, "connection state changed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_state(&self.connection, next.code());
        }
    }

    /// Receiver for tests and supervisors that wait on a transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state equals `target`.
    pub async fn wait_for(&self, target: ConnectionState) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_lifecycle_order() {
        let codes: Vec<i64> = [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Running,
            ConnectionState::Reconnecting,
            ConnectionState::Stopping,
        ]
        .iter()
        .map(|state| state.code())
        .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
        assert!(!ConnectionState::Idle.is_active());
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test]
    async fn transitions_are_observable() {
        let handle = StateHandle::new("conn", None);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for(ConnectionState::Running).await })
        };
        handle.set(ConnectionState::Connecting);
        handle.set(ConnectionState::Running);
        waiter.await.unwrap();
        assert_eq!(handle.get(), ConnectionState::Running);
    }
}
