//! Error types for client operations

use std::io;
use thiserror::Error;

/// Result type for client operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for client operations
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The reply stream is malformed; the connection can no longer be trusted
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error for one command
    #[error("Server error: {0}")]
    Server(String),

    /// MOVED redirect in cluster mode
    #[error("MOVED redirect: slot {slot} to {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// ASK redirect in cluster mode
    #[error("ASK redirect: slot {slot} to {host}:{port}")]
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// Failed to establish a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection was torn down while the request was pending or queued
    #[error("Connection to {endpoint} closed: {reason}")]
    ConnectionClosed {
        /// Endpoint the request was bound to
        endpoint: String,
        /// Why the connection went away
        reason: String,
    },

    /// Command submitted while the connection was not ready and offline queueing is off
    #[error("Connection to {endpoint} is not ready and the offline queue is disabled")]
    NotReady {
        /// Endpoint the request was bound to
        endpoint: String,
    },

    /// Per-command timeout elapsed before the reply arrived
    #[error("Command {command} to {endpoint} timed out")]
    Timeout {
        /// Command name
        command: String,
        /// Endpoint the request was sent to
        endpoint: String,
    },

    /// Keys of one command hash to different cluster slots
    #[error("CROSSSLOT keys of {command} don't hash to the same slot")]
    CrossSlot {
        /// Command name
        command: String,
    },

    /// Router retry budget spent on redirects or transient cluster errors
    #[error("Command {command} failed after {attempts} cluster attempts: {source}")]
    RedirectExhausted {
        /// Command name
        command: String,
        /// Number of attempts made
        attempts: u32,
        /// Last underlying error
        #[source]
        source: Box<RedisError>,
    },

    /// A cluster node could not be reached after its own reconnect policy gave up
    #[error("Node {endpoint} unreachable: {source}")]
    NodeUnreachable {
        /// Node address
        endpoint: String,
        /// Last transport-level error
        #[source]
        source: Box<RedisError>,
    },

    /// A MULTI/EXEC batch was rejected as a whole
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Cluster error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RedisError {
    /// Parse a server error message to check for MOVED or ASK redirects
    #[must_use]
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        let (is_ask, rest) = if let Some(rest) = msg.strip_prefix("MOVED ") {
            (false, rest)
        } else if let Some(rest) = msg.strip_prefix("ASK ") {
            (true, rest)
        } else {
            return None;
        };

        let mut parts = rest.split_whitespace();
        let slot = parts.next()?.parse::<u16>().ok()?;
        let (host, port) = parts.next()?.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if parts.next().is_some() {
            return None;
        }

        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        Some(if is_ask {
            Self::Ask { slot, host, port }
        } else {
            Self::Moved { slot, host, port }
        })
    }

    /// Build the error for a server error reply, recognising redirects
    #[must_use]
    pub fn from_server_message(msg: String) -> Self {
        Self::parse_redirect(&msg).unwrap_or(Self::Server(msg))
    }

    /// Check if this error is a redirect (MOVED or ASK)
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Ask { .. })
    }

    /// Get the target address from a redirect error
    #[must_use]
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => {
                Some((host.clone(), *port))
            }
            _ => None,
        }
    }

    /// Get the slot number from a redirect error
    #[must_use]
    pub const fn redirect_slot(&self) -> Option<u16> {
        match self {
            Self::Moved { slot, .. } | Self::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Cluster is resharding or temporarily down; the same command may succeed later
    #[must_use]
    pub fn is_cluster_transient(&self) -> bool {
        match self {
            Self::Server(msg) => msg.starts_with("TRYAGAIN") || msg.starts_with("CLUSTERDOWN"),
            _ => false,
        }
    }

    /// The error came from the transport rather than from the server
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Connection(_)
                | Self::ConnectionClosed { .. }
                | Self::NotReady { .. }
                | Self::NodeUnreachable { .. }
        )
    }

    /// Whether the server rejected a script because it is not cached
    #[must_use]
    pub fn is_noscript(&self) -> bool {
        matches!(self, Self::Server(msg) if msg.starts_with("NOSCRIPT"))
    }
}
