//! High-level client
//!
//! [`Client`] detects whether it talks to a standalone server or a cluster
//! and exposes one `send` entry point over either. Pipelines, transactions,
//! subscribers and scripts are all built on it.

use crate::cluster::ClusterRouter;
use crate::command::Cmd;
use crate::connection::{Connection, ConnectionEvent, SharedConnector, TcpConnector};
use crate::discovery::Discovery;
use crate::pipeline::{Pipeline, PipelineExecutor};
use crate::pubsub::Subscriber;
use crate::transaction::Transaction;
use async_trait::async_trait;
use resp_oxide_core::{
    config::{ConnectionConfig, Endpoint, TopologyMode},
    error::{RedisError, RedisResult},
    types::RedisValue,
    value::RespValue,
};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

enum Topology {
    Standalone(Connection),
    Cluster(ClusterRouter),
}

/// High-level client
///
/// Automatically handles:
/// - Topology detection (standalone or cluster)
/// - MOVED and ASK redirects in cluster mode
/// - Offline queueing and reconnection with the configured retry policy
/// - Following failovers announced by a [`Discovery`]
#[derive(Clone)]
pub struct Client {
    topology: Arc<Topology>,
    connector: SharedConnector,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.topology {
            Topology::Standalone(conn) => f
                .debug_struct("Client")
                .field("endpoint", &conn.endpoint())
                .field("state", &conn.state())
                .finish(),
            Topology::Cluster(router) => f.debug_struct("Client").field("cluster", router).finish(),
        }
    }
}

impl Client {
    /// Connect with the given configuration
    ///
    /// # Example
    ///
    /// ```no_run
    /// use resp_oxide::{Client, ConnectionConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = ConnectionConfig::new("redis://localhost:6379");
    ///     let client = Client::connect(config).await?;
    ///     Ok(())
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is invalid or no server can be reached.
    pub async fn connect(config: ConnectionConfig) -> RedisResult<Self> {
        Self::connect_with_connector(config, Arc::new(TcpConnector)).await
    }

    /// Connect using a custom transport connector
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is invalid or no server can be reached.
    pub async fn connect_with_connector(
        config: ConnectionConfig,
        connector: SharedConnector,
    ) -> RedisResult<Self> {
        let endpoints = config.parse_endpoints()?;
        Self::connect_to(endpoints, config, connector).await
    }

    /// Connect to the endpoints `discovery` supplies and follow its failovers
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or no server can be reached.
    pub async fn connect_with_discovery(
        config: ConnectionConfig,
        discovery: Arc<dyn Discovery>,
    ) -> RedisResult<Self> {
        Self::connect_with_discovery_and_connector(config, discovery, Arc::new(TcpConnector)).await
    }

    /// [`connect_with_discovery`](Self::connect_with_discovery) over a custom connector
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or no server can be reached.
    pub async fn connect_with_discovery_and_connector(
        config: ConnectionConfig,
        discovery: Arc<dyn Discovery>,
        connector: SharedConnector,
    ) -> RedisResult<Self> {
        // Subscribe first so a failover during connect is not missed
        let changes = discovery.primary_changes();
        let endpoints = discovery.endpoints().await?;
        let client = Self::connect_to(endpoints, config, connector).await?;
        follow_failovers(Arc::downgrade(&client.topology), changes);
        Ok(client)
    }

    async fn connect_to(
        endpoints: Vec<Endpoint>,
        config: ConnectionConfig,
        connector: SharedConnector,
    ) -> RedisResult<Self> {
        info!("Connecting to Redis...");
        let topology = match config.topology_mode {
            TopologyMode::Cluster => Self::cluster(endpoints, config, &connector).await?,
            TopologyMode::Standalone => {
                let first = first_endpoint(&endpoints)?;
                let conn =
                    Connection::connect_with_connector(first, config, Arc::clone(&connector))
                        .await?;
                Topology::Standalone(conn)
            }
            TopologyMode::Auto => {
                let first = first_endpoint(&endpoints)?;
                let probe = Connection::connect_with_connector(
                    first,
                    config.clone(),
                    Arc::clone(&connector),
                )
                .await?;
                if detect_cluster(&probe).await? {
                    info!("Detected Redis Cluster");
                    probe.quit().await;
                    Self::cluster(endpoints, config, &connector).await?
                } else {
                    info!("Detected standalone Redis at {}", probe.endpoint());
                    if endpoints.len() > 1 {
                        debug!("Ignoring {} extra endpoints", endpoints.len() - 1);
                    }
                    Topology::Standalone(probe)
                }
            }
        };

        Ok(Self {
            topology: Arc::new(topology),
            connector,
        })
    }

    async fn cluster(
        seeds: Vec<Endpoint>,
        config: ConnectionConfig,
        connector: &SharedConnector,
    ) -> RedisResult<Topology> {
        let router = ClusterRouter::from_seeds(seeds, config, Arc::clone(connector)).await?;
        Ok(Topology::Cluster(router))
    }

    /// Whether the client routes over a cluster
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        matches!(&*self.topology, Topology::Cluster(_))
    }

    /// The standalone connection, if this is not a cluster client
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> {
        match &*self.topology {
            Topology::Standalone(conn) => Some(conn),
            Topology::Cluster(_) => None,
        }
    }

    /// The cluster router, if this is a cluster client
    #[must_use]
    pub fn router(&self) -> Option<&ClusterRouter> {
        match &*self.topology {
            Topology::Standalone(_) => None,
            Topology::Cluster(router) => Some(router),
        }
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        match &*self.topology {
            Topology::Standalone(conn) => conn.events(),
            Topology::Cluster(router) => router.events(),
        }
    }

    /// Send any command and wait for its reply
    ///
    /// # Errors
    ///
    /// Returns the server's error reply, a transport error, or a routing error in cluster mode.
    pub async fn send(&self, cmd: &Cmd) -> RedisResult<RespValue> {
        match &*self.topology {
            Topology::Standalone(conn) => conn.send(cmd).await,
            Topology::Cluster(router) => router.send(cmd).await,
        }
    }

    /// Send a command and convert its reply
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`send`](Self::send), or a conversion error.
    pub async fn query<T>(&self, cmd: &Cmd) -> RedisResult<T>
    where
        T: TryFrom<RespValue>,
        T::Error: Into<RedisError>,
    {
        let value = self.send(cmd).await?;
        T::try_from(value).map_err(Into::into)
    }

    /// PING the server
    pub async fn ping(&self) -> RedisResult<String> {
        self.query(&Cmd::new("PING")).await
    }

    /// GET a key; `None` if it does not exist
    pub async fn get(&self, key: impl Into<RedisValue>) -> RedisResult<Option<String>> {
        let value = self.send(&Cmd::new("GET").arg(key)).await?;
        if value.is_null() {
            Ok(None)
        } else {
            value.as_string().map(Some)
        }
    }

    /// SET a key
    pub async fn set(
        &self,
        key: impl Into<RedisValue>,
        value: impl Into<RedisValue>,
    ) -> RedisResult<()> {
        self.send(&Cmd::new("SET").arg(key).arg(value)).await?;
        Ok(())
    }

    /// DEL keys, returning how many existed
    pub async fn del(&self, keys: Vec<String>) -> RedisResult<i64> {
        self.query(&Cmd::new("DEL").args(keys)).await
    }

    /// INCR a key
    pub async fn incr(&self, key: impl Into<RedisValue>) -> RedisResult<i64> {
        self.query(&Cmd::new("INCR").arg(key)).await
    }

    /// PUBLISH a message, returning the number of receivers
    pub async fn publish(
        &self,
        channel: impl Into<RedisValue>,
        message: impl Into<RedisValue>,
    ) -> RedisResult<i64> {
        self.query(&Cmd::new("PUBLISH").arg(channel).arg(message))
            .await
    }

    /// Start a pipeline
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(Arc::new(self.clone()))
    }

    /// Start a MULTI/EXEC transaction
    #[must_use]
    pub fn transaction(&self) -> Transaction {
        Transaction::new(Arc::new(self.clone()))
    }

    /// Open a subscriber on its own connection
    ///
    /// In cluster mode the connection goes to a primary; sharded channels
    /// need [`subscriber_for`](Self::subscriber_for) instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub async fn subscriber(&self) -> RedisResult<Subscriber> {
        self.subscriber_connection(None).await.map(Subscriber::new)
    }

    /// Open a subscriber on the node serving `channel`
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub async fn subscriber_for(&self, channel: &str) -> RedisResult<Subscriber> {
        self.subscriber_connection(Some(channel.as_bytes()))
            .await
            .map(Subscriber::new)
    }

    async fn subscriber_connection(&self, channel: Option<&[u8]>) -> RedisResult<Connection> {
        match &*self.topology {
            Topology::Standalone(conn) => {
                Connection::connect_with_connector(
                    conn.endpoint(),
                    conn.config().clone(),
                    Arc::clone(&self.connector),
                )
                .await
            }
            Topology::Cluster(router) => router.subscriber_connection(channel).await,
        }
    }

    /// Send QUIT after everything queued so far
    pub async fn quit(&self) {
        match &*self.topology {
            Topology::Standalone(conn) => conn.quit().await,
            Topology::Cluster(router) => router.close().await,
        }
    }
}

#[async_trait]
impl PipelineExecutor for Client {
    async fn execute_pipeline(
        &self,
        commands: &[Cmd],
    ) -> RedisResult<Vec<RedisResult<RespValue>>> {
        match &*self.topology {
            Topology::Standalone(conn) => conn.execute_pipeline(commands).await,
            Topology::Cluster(router) => router.execute_pipeline(commands).await,
        }
    }

    async fn execute_transaction(
        &self,
        commands: &[Cmd],
    ) -> RedisResult<Vec<RedisResult<RespValue>>> {
        match &*self.topology {
            Topology::Standalone(conn) => conn.execute_transaction(commands).await,
            Topology::Cluster(router) => router.execute_transaction(commands).await,
        }
    }
}

fn first_endpoint(endpoints: &[Endpoint]) -> RedisResult<Endpoint> {
    endpoints
        .first()
        .cloned()
        .ok_or_else(|| RedisError::Config("No endpoints to connect to".to_string()))
}

/// Ask a freshly connected server whether it runs in cluster mode
async fn detect_cluster(probe: &Connection) -> RedisResult<bool> {
    if let Some(mode) = probe.negotiation().and_then(|n| n.mode) {
        debug!("HELLO reported mode {}", mode);
        return Ok(mode == "cluster");
    }

    match probe.send(&Cmd::new("CLUSTER").arg("INFO")).await {
        Ok(reply) => Ok(reply
            .as_string()
            .map(|info| reports_cluster(&info))
            .unwrap_or(false)),
        Err(RedisError::Server(msg)) => {
            // unknown command, or cluster support disabled
            debug!("CLUSTER INFO rejected ({}), assuming standalone", msg);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn reports_cluster(info: &str) -> bool {
    info.lines().any(|line| line.trim() == "cluster_enabled:1")
}

fn follow_failovers(topology: Weak<Topology>, mut changes: broadcast::Receiver<Endpoint>) {
    tokio::spawn(async move {
        loop {
            let endpoint = match changes.recv().await {
                Ok(endpoint) => endpoint,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} failover notifications", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(topology) = topology.upgrade() else {
                break;
            };
            match &*topology {
                Topology::Standalone(conn) => {
                    info!("Primary moved to {}, retargeting", endpoint);
                    conn.retarget(endpoint);
                }
                Topology::Cluster(router) => {
                    if let Err(e) = router.primary_changed(&endpoint).await {
                        warn!("Topology refresh after failover failed: {}", e);
                    }
                }
            }
        }
    });
}
