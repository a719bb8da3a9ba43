//! Configuration types for connections, pipelining and cluster routing

use crate::error::{RedisError, RedisResult};
use crate::retry::{ExponentialBackoff, SharedRetryPolicy};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default server port
pub const DEFAULT_PORT: u16 = 6379;

/// Connect attempts after the first before a connection gives up for good
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

/// Protocol version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// RESP2 (Redis Serialization Protocol version 2) - Default
    #[default]
    Resp2,
    /// RESP3, negotiated with HELLO 3; falls back to RESP2 if refused
    Resp3,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resp2 => write!(f, "RESP2"),
            Self::Resp3 => write!(f, "RESP3"),
        }
    }
}

/// Topology detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyMode {
    /// Automatically detect topology (Standalone or Cluster)
    Auto,
    /// Force standalone mode
    Standalone,
    /// Force cluster mode
    Cluster,
}

/// Where a connection points
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP host and port
    Tcp {
        /// Host name or address
        host: String,
        /// Port number
        port: u16,
    },
    /// Unix domain socket path
    Unix(PathBuf),
}

impl Endpoint {
    /// TCP endpoint
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `host`, `[v6]:port` or `unix:///path`
    ///
    /// # Errors
    ///
    /// Returns an error if the port is not a number.
    pub fn parse(addr: &str) -> RedisResult<Self> {
        let addr = addr.trim();
        if let Some(path) = addr.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if addr.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(addr)));
        }
        // Bare IPv6 literal without a port
        if addr.matches(':').count() > 1 && !addr.starts_with('[') {
            return Ok(Self::tcp(addr, DEFAULT_PORT));
        }
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RedisError::Config(format!("Invalid port in address: {addr}")))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok(Self::tcp(host, port))
            }
            None => Ok(Self::tcp(addr, DEFAULT_PORT)),
        }
    }

    /// `host:port` (or the socket path) used as a map key and in error messages
    #[must_use]
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Automatic pipelining window
///
/// Commands issued while a flush is pending are coalesced into one write.
/// A flush happens when `max_batch` commands are buffered or `window` has
/// elapsed since the first buffered command, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct AutoPipelineConfig {
    /// Enable the batching window
    pub enabled: bool,
    /// Flush once this many commands are buffered
    pub max_batch: usize,
    /// Flush at the latest this long after the first buffered command
    pub window: Duration,
}

impl Default for AutoPipelineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch: 128,
            window: Duration::from_micros(50),
        }
    }
}

/// Where read-only commands go in a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Everything goes to the primary
    #[default]
    Primary,
    /// Reads go to replicas, falling back to the primary when none is healthy
    Replica,
    /// Reads rotate over the primary and its replicas
    Any,
}

/// Cluster router settings
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Budget for MOVED/ASK/TRYAGAIN/CLUSTERDOWN retries
    pub retry: SharedRetryPolicy,
    /// Read/write splitting
    pub read_policy: ReadPolicy,
    /// Minimum time between two topology refreshes triggered by redirects
    pub refresh_cooldown: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            retry: SharedRetryPolicy::new(
                ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(2))
                    .with_max_attempts(16),
            ),
            read_policy: ReadPolicy::Primary,
            refresh_cooldown: Duration::ZERO,
        }
    }
}

/// Configuration for a client
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection string (e.g., `<redis://localhost:6379>` or `<redis://host1:6379,host2:6379>`)
    pub connection_string: String,

    /// Optional ACL username
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Database number (only for standalone mode)
    pub database: u8,

    /// Name announced with CLIENT SETNAME
    pub client_name: Option<String>,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Per-command timeout (None = wait forever)
    pub command_timeout: Option<Duration>,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,

    /// Topology detection mode
    pub topology_mode: TopologyMode,

    /// Preferred protocol version
    pub protocol_version: ProtocolVersion,

    /// Queue commands issued before the connection is ready
    pub offline_queue: bool,

    /// Delay connecting until the first command
    pub lazy_connect: bool,

    /// Re-send requests that were in flight when the connection dropped
    pub resend_unfulfilled: bool,

    /// Reconnection policy, also applied to the first connect
    pub reconnect: SharedRetryPolicy,

    /// Automatic pipelining
    pub auto_pipeline: AutoPipelineConfig,

    /// Cluster router settings
    pub cluster: ClusterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://localhost:6379".to_string(),
            username: None,
            password: None,
            database: 0,
            client_name: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: None,
            tcp_keepalive: Some(Duration::from_secs(60)),
            topology_mode: TopologyMode::Auto,
            protocol_version: ProtocolVersion::default(),
            offline_queue: true,
            lazy_connect: false,
            resend_unfulfilled: false,
            reconnect: SharedRetryPolicy::new(
                ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(2))
                    .with_max_attempts(DEFAULT_RECONNECT_ATTEMPTS),
            ),
            auto_pipeline: AutoPipelineConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with the given connection string
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set ACL username and password
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the database number
    #[must_use]
    pub const fn with_database(mut self, database: u8) -> Self {
        self.database = database;
        self
    }

    /// Set the client name
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-command timeout
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Set the topology mode
    #[must_use]
    pub const fn with_topology_mode(mut self, mode: TopologyMode) -> Self {
        self.topology_mode = mode;
        self
    }

    /// Set the preferred protocol version
    #[must_use]
    pub const fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Enable or disable the offline queue
    #[must_use]
    pub const fn with_offline_queue(mut self, enabled: bool) -> Self {
        self.offline_queue = enabled;
        self
    }

    /// Delay connecting until the first command
    #[must_use]
    pub const fn with_lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    /// Re-send in-flight requests after a reconnect instead of failing them
    #[must_use]
    pub const fn with_resend_unfulfilled(mut self, resend: bool) -> Self {
        self.resend_unfulfilled = resend;
        self
    }

    /// Set the reconnect policy
    #[must_use]
    pub fn with_reconnect(mut self, policy: SharedRetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the automatic pipelining window
    #[must_use]
    pub const fn with_auto_pipeline(mut self, auto_pipeline: AutoPipelineConfig) -> Self {
        self.auto_pipeline = auto_pipeline;
        self
    }

    /// Set the cluster router settings
    #[must_use]
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Set the read policy for cluster replicas
    #[must_use]
    pub const fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.cluster.read_policy = policy;
        self
    }

    /// Whether AUTH is needed during the handshake
    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        self.password.is_some()
    }

    /// Parse connection endpoints from connection string
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is present or a port is malformed.
    pub fn parse_endpoints(&self) -> RedisResult<Vec<Endpoint>> {
        let conn_str = self.connection_string.trim();

        if conn_str.starts_with("unix://") {
            return Ok(vec![Endpoint::parse(conn_str)?]);
        }

        let addr_part = conn_str
            .strip_prefix("redis://")
            .or_else(|| conn_str.strip_prefix("rediss://"))
            .unwrap_or(conn_str);

        // Drop credentials (user:pass@) and a trailing /db
        let addr_part = addr_part.rsplit_once('@').map_or(addr_part, |(_, hosts)| hosts);
        let addr_part = addr_part.split_once('/').map_or(addr_part, |(hosts, _)| hosts);

        let endpoints = addr_part
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(Endpoint::parse)
            .collect::<RedisResult<Vec<_>>>()?;

        if endpoints.is_empty() {
            return Err(RedisError::Config("No endpoints specified".to_string()));
        }
        Ok(endpoints)
    }
}
