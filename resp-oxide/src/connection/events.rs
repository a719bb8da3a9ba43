//! Lifecycle events observable by the application

use resp_oxide_core::config::Endpoint;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per subscriber before old ones are dropped
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Something that happened to a connection or the cluster topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connect attempt is starting
    Connecting {
        /// Endpoint being connected to
        endpoint: Endpoint,
        /// 0 for the first attempt, then the reconnect attempt number
        attempt: u32,
    },
    /// Transport established and handshake complete
    Connected {
        /// Endpoint the connection is bound to
        endpoint: Endpoint,
    },
    /// Transport lost
    Disconnected {
        /// Endpoint the connection was bound to
        endpoint: Endpoint,
        /// Reason the transport went away
        reason: String,
    },
    /// A reconnect attempt is scheduled
    Reconnecting {
        /// Endpoint being reconnected to
        endpoint: Endpoint,
        /// Attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// The connection is shutting down; pending replies may still arrive
    Closing {
        /// Endpoint the connection is bound to
        endpoint: Endpoint,
        /// Why the connection is closing
        reason: String,
    },
    /// The connection will not be used again
    End {
        /// Endpoint the connection was bound to
        endpoint: Endpoint,
    },
    /// A fatal error on the connection
    Error {
        /// Endpoint the connection is bound to
        endpoint: Endpoint,
        /// Error description
        message: String,
    },
    /// A node appeared in the cluster slot map
    NodeAdded {
        /// Node address
        address: String,
    },
    /// A node disappeared from the cluster slot map
    NodeRemoved {
        /// Node address
        address: String,
    },
}

impl ConnectionEvent {
    /// Endpoint of a per-connection event
    #[must_use]
    pub const fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            Self::Connecting { endpoint, .. }
            | Self::Connected { endpoint }
            | Self::Closing { endpoint, .. }
            | Self::Disconnected { endpoint, .. }
            | Self::Reconnecting { endpoint, .. }
            | Self::End { endpoint }
            | Self::Error { endpoint, .. } => Some(endpoint),
            Self::NodeAdded { .. } | Self::NodeRemoved { .. } => None,
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { endpoint, attempt } => {
                write!(f, "connecting to {endpoint} (attempt {attempt})")
            }
            Self::Connected { endpoint } => write!(f, "connected to {endpoint}"),
            Self::Closing { endpoint, reason } => write!(f, "closing {endpoint}: {reason}"),
            Self::Disconnected { endpoint, reason } => {
                write!(f, "disconnected from {endpoint}: {reason}")
            }
            Self::Reconnecting {
                endpoint,
                attempt,
                delay,
            } => write!(
                f,
                "reconnecting to {endpoint} (attempt {attempt}) in {delay:?}"
            ),
            Self::End { endpoint } => write!(f, "connection to {endpoint} ended"),
            Self::Error { endpoint, message } => write!(f, "error on {endpoint}: {message}"),
            Self::NodeAdded { address } => write!(f, "node {address} added"),
            Self::NodeRemoved { address } => write!(f, "node {address} removed"),
        }
    }
}

/// Fan-out of events to any number of receivers
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventEmitter {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        trace!("event: {}", event);
        // No receivers is not an error
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_fans_out() {
        let emitter = EventEmitter::new();
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();
        let endpoint = Endpoint::tcp("127.0.0.1", 6379);

        emitter.emit(ConnectionEvent::Connected {
            endpoint: endpoint.clone(),
        });

        assert_eq!(a.recv().await.unwrap().endpoint(), Some(&endpoint));
        assert!(matches!(
            b.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));
    }

    #[test]
    fn test_emit_without_receivers() {
        let emitter = EventEmitter::new();
        emitter.emit(ConnectionEvent::NodeAdded {
            address: "10.0.0.1:7000".into(),
        });
        assert_eq!(
            ConnectionEvent::NodeRemoved {
                address: "n:1".into()
            }
            .to_string(),
            "node n:1 removed"
        );
    }
}
