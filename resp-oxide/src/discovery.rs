//! Failover discovery
//!
//! A [`Discovery`] supplies the endpoints a client starts from and announces
//! when a primary is replaced. The client reacts by retargeting a standalone
//! connection or by refreshing the cluster topology with the new primary as
//! the first node to ask.
//!
//! [`SentinelDiscovery`] asks Redis Sentinel for the current primary and
//! follows its `+switch-master` notifications; [`StaticDiscovery`] is a
//! fixed endpoint list whose changes are announced by hand.

use crate::command::Cmd;
use crate::connection::{Connection, SharedConnector, TcpConnector};
use crate::pubsub::Subscriber;
use async_trait::async_trait;
use resp_oxide_core::{
    config::{ConnectionConfig, Endpoint, TopologyMode},
    error::{RedisError, RedisResult},
    retry::{NoRetry, SharedRetryPolicy},
    value::RespValue,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Source of endpoints and primary-changed notifications
#[async_trait]
pub trait Discovery: Send + Sync + fmt::Debug {
    /// Endpoints to connect to initially
    async fn endpoints(&self) -> RedisResult<Vec<Endpoint>>;

    /// Receive an endpoint each time a primary is replaced
    fn primary_changes(&self) -> broadcast::Receiver<Endpoint>;
}

/// A fixed endpoint list
#[derive(Debug)]
pub struct StaticDiscovery {
    endpoints: Vec<Endpoint>,
    changes: broadcast::Sender<Endpoint>,
}

impl StaticDiscovery {
    /// Discovery that always returns `endpoints`
    #[must_use]
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self { endpoints, changes }
    }

    /// Announce that `endpoint` is now the primary
    pub fn announce(&self, endpoint: Endpoint) {
        // Nobody listening is fine
        let _ = self.changes.send(endpoint);
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn endpoints(&self) -> RedisResult<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }

    fn primary_changes(&self) -> broadcast::Receiver<Endpoint> {
        self.changes.subscribe()
    }
}

/// Where to find the sentinels and which primary to follow
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Name the sentinels monitor the primary under
    pub master_name: String,
    /// Sentinel endpoints, tried in order
    pub sentinels: Vec<Endpoint>,
    /// Password for the sentinels themselves
    pub password: Option<String>,
}

impl SentinelConfig {
    /// Configuration for the primary monitored as `master_name`
    #[must_use]
    pub fn new(master_name: impl Into<String>) -> Self {
        Self {
            master_name: master_name.into(),
            sentinels: Vec::new(),
            password: None,
        }
    }

    /// Add a sentinel address (`host:port`)
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn add_sentinel(mut self, addr: impl AsRef<str>) -> RedisResult<Self> {
        self.sentinels.push(Endpoint::parse(addr.as_ref())?);
        Ok(self)
    }

    /// Set the sentinel password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            password: self.password.clone(),
            topology_mode: TopologyMode::Standalone,
            reconnect: SharedRetryPolicy::new(NoRetry),
            ..ConnectionConfig::default()
        }
    }
}

/// Discovery backed by Redis Sentinel
pub struct SentinelDiscovery {
    config: SentinelConfig,
    connector: SharedConnector,
    changes: broadcast::Sender<Endpoint>,
    watcher: JoinHandle<()>,
}

impl fmt::Debug for SentinelDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelDiscovery")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SentinelDiscovery {
    /// Connect to the sentinels and start following failovers
    ///
    /// # Errors
    ///
    /// Returns an error if no sentinel is configured or none can be reached.
    pub async fn connect(config: SentinelConfig) -> RedisResult<Self> {
        Self::connect_with_connector(config, Arc::new(TcpConnector)).await
    }

    /// Connect using a custom transport connector
    ///
    /// # Errors
    ///
    /// Returns an error if no sentinel is configured or none can be reached.
    pub async fn connect_with_connector(
        config: SentinelConfig,
        connector: SharedConnector,
    ) -> RedisResult<Self> {
        if config.sentinels.is_empty() {
            return Err(RedisError::Config("No sentinels configured".to_string()));
        }

        let mut subscriber = None;
        for sentinel in &config.sentinels {
            match Self::follow(&config, sentinel, &connector).await {
                Ok(found) => {
                    info!("Following {} via sentinel {}", config.master_name, sentinel);
                    subscriber = Some(found);
                    break;
                }
                Err(e) => warn!("Failed to subscribe on sentinel {}: {}", sentinel, e),
            }
        }
        let subscriber = subscriber
            .ok_or_else(|| RedisError::Connection("No sentinel available".to_string()))?;

        let (changes, _) = broadcast::channel(16);
        let watcher = tokio::spawn(watch_failovers(
            subscriber,
            config.master_name.clone(),
            changes.clone(),
        ));

        Ok(Self {
            config,
            connector,
            changes,
            watcher,
        })
    }

    async fn follow(
        config: &SentinelConfig,
        sentinel: &Endpoint,
        connector: &SharedConnector,
    ) -> RedisResult<Subscriber> {
        let connection = Connection::connect_with_connector(
            sentinel.clone(),
            config.connection_config(),
            Arc::clone(connector),
        )
        .await?;
        let mut subscriber = Subscriber::new(connection);
        subscriber
            .subscribe(vec![SWITCH_MASTER_CHANNEL.to_string()])
            .await?;
        Ok(subscriber)
    }

    /// Ask the sentinels for the current primary
    ///
    /// # Errors
    ///
    /// Returns an error if no sentinel knows the primary.
    pub async fn primary(&self) -> RedisResult<Endpoint> {
        for sentinel in &self.config.sentinels {
            match self.query_primary(sentinel).await {
                Ok(endpoint) => {
                    debug!("Sentinel {} reports primary {}", sentinel, endpoint);
                    return Ok(endpoint);
                }
                Err(e) => debug!("Failed to query primary from sentinel {}: {}", sentinel, e),
            }
        }
        Err(RedisError::Connection(format!(
            "Failed to discover primary '{}' from any sentinel",
            self.config.master_name
        )))
    }

    async fn query_primary(&self, sentinel: &Endpoint) -> RedisResult<Endpoint> {
        let connection = Connection::connect_with_connector(
            sentinel.clone(),
            self.config.connection_config(),
            Arc::clone(&self.connector),
        )
        .await?;
        let reply = connection
            .send(
                &Cmd::new("SENTINEL")
                    .arg("GET-MASTER-ADDR-BY-NAME")
                    .arg(self.config.master_name.as_str()),
            )
            .await;
        connection.quit().await;
        parse_primary_address(reply?, &self.config.master_name)
    }
}

impl Drop for SentinelDiscovery {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl Discovery for SentinelDiscovery {
    async fn endpoints(&self) -> RedisResult<Vec<Endpoint>> {
        Ok(vec![self.primary().await?])
    }

    fn primary_changes(&self) -> broadcast::Receiver<Endpoint> {
        self.changes.subscribe()
    }
}

async fn watch_failovers(
    mut subscriber: Subscriber,
    master_name: String,
    changes: broadcast::Sender<Endpoint>,
) {
    loop {
        match subscriber.next_message().await {
            Ok(Some(message)) => {
                if let Some(endpoint) = parse_switch_master(&message.payload_str(), &master_name) {
                    info!("Sentinel reports failover of {} to {}", master_name, endpoint);
                    let _ = changes.send(endpoint);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Sentinel subscription failed: {}", e);
                break;
            }
        }
    }
    debug!("Stopped following failovers of {}", master_name);
}

/// `<name> <old-ip> <old-port> <new-ip> <new-port>`
fn parse_switch_master(payload: &str, master_name: &str) -> Option<Endpoint> {
    let parts: Vec<&str> = payload.split_whitespace().collect();
    match parts.as_slice() {
        [name, _, _, host, port] if *name == master_name => {
            Some(Endpoint::tcp(*host, port.parse().ok()?))
        }
        _ => None,
    }
}

fn parse_primary_address(reply: RespValue, master_name: &str) -> RedisResult<Endpoint> {
    if reply.is_null() {
        return Err(RedisError::Config(format!(
            "Sentinel does not monitor '{master_name}'"
        )));
    }
    match reply.as_array()?.as_slice() {
        [host, port] => {
            let host = host.as_string()?;
            let port = port
                .as_string()?
                .parse::<u16>()
                .map_err(|_| RedisError::Protocol("Invalid primary port".to_string()))?;
            Ok(Endpoint::tcp(host, port))
        }
        _ => Err(RedisError::UnexpectedResponse(
            "GET-MASTER-ADDR-BY-NAME returned an unexpected shape".to_string(),
        )),
    }
}
