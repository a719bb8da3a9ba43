//! Cluster router
//!
//! Commands are hashed to a slot, looked up in the current [`SlotMap`] and
//! sent over that node's connection. MOVED patches the map, refreshes the
//! topology and retries; ASK retries once at the named node behind ASKING;
//! TRYAGAIN and CLUSTERDOWN wait out the retry policy delay. Concurrent
//! redirects share one refresh: a handler that finds the topology already
//! replaced since it routed its command reuses that refresh.

use super::slot::{command_slot, key_slot, SlotMap};
use crate::command::Cmd;
use crate::connection::events::EventEmitter;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionState, SharedConnector, TcpConnector,
};
use crate::pipeline::{
    batch_name, encode_batch, encode_transaction, split_replies, transaction_outcome,
    PipelineExecutor,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use resp_oxide_core::{
    config::{ConnectionConfig, Endpoint, ReadPolicy},
    error::{RedisError, RedisResult},
    retry::{RetryPolicy, SharedRetryPolicy},
    types::NodeInfo,
    value::RespValue,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    address: String,
    readonly: bool,
}

/// Routes commands across the nodes of a cluster
pub struct ClusterRouter {
    node_config: Arc<ConnectionConfig>,
    connector: SharedConnector,
    seeds: Vec<Endpoint>,
    retry: SharedRetryPolicy,
    read_policy: ReadPolicy,
    topology: RwLock<Arc<SlotMap>>,
    nodes: Mutex<HashMap<NodeKey, Connection>>,
    /// Held for the duration of a refresh; remembers when the last one finished
    refresh_lock: Mutex<Option<Instant>>,
    epoch: AtomicU64,
    refreshes: AtomicU64,
    round_robin: AtomicUsize,
    events: EventEmitter,
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("seeds", &self.seeds)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ClusterRouter {
    /// Connect to the cluster behind the seed endpoints in `config`
    ///
    /// # Errors
    ///
    /// Returns an error if no seed answers `CLUSTER SLOTS`.
    pub async fn connect(config: ConnectionConfig) -> RedisResult<Self> {
        Self::connect_with_connector(config, Arc::new(TcpConnector)).await
    }

    /// Connect using a custom transport connector
    ///
    /// # Errors
    ///
    /// Returns an error if no seed answers `CLUSTER SLOTS`.
    pub async fn connect_with_connector(
        config: ConnectionConfig,
        connector: SharedConnector,
    ) -> RedisResult<Self> {
        let seeds = config.parse_endpoints()?;
        Self::from_seeds(seeds, config, connector).await
    }

    /// Connect to the cluster behind `seeds`, ignoring the connection string
    ///
    /// # Errors
    ///
    /// Returns an error if no seed answers `CLUSTER SLOTS`.
    pub async fn from_seeds(
        seeds: Vec<Endpoint>,
        config: ConnectionConfig,
        connector: SharedConnector,
    ) -> RedisResult<Self> {
        info!("Connecting to cluster via {} seed nodes", seeds.len());

        let retry = config.cluster.retry.clone();
        let read_policy = config.cluster.read_policy;
        let node_config = ConnectionConfig {
            // Nodes connect eagerly so an unreachable node surfaces as NodeUnreachable
            lazy_connect: false,
            database: 0,
            ..config
        };

        let router = Self {
            node_config: Arc::new(node_config),
            connector,
            seeds,
            retry,
            read_policy,
            topology: RwLock::new(Arc::new(SlotMap::default())),
            nodes: Mutex::new(HashMap::new()),
            refresh_lock: Mutex::new(None),
            epoch: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
            events: EventEmitter::new(),
        };
        router.refresh().await?;
        Ok(router)
    }

    /// Current slot map snapshot
    pub async fn slot_map(&self) -> Arc<SlotMap> {
        Arc::clone(&*self.topology.read().await)
    }

    /// Known nodes and the slots they serve
    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.slot_map().await.nodes()
    }

    /// Number of topology refreshes performed so far
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Acquire)
    }

    /// Subscribe to connection and topology events of every node
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Reload the slot map now
    ///
    /// # Errors
    ///
    /// Returns an error if no known node answers `CLUSTER SLOTS`.
    pub async fn refresh(&self) -> RedisResult<()> {
        let mut last = self.refresh_lock.lock().await;
        self.reload(None).await?;
        *last = Some(Instant::now());
        Ok(())
    }

    /// A primary was replaced; treat `endpoint` as authoritative and refresh
    ///
    /// # Errors
    ///
    /// Returns an error if no known node answers `CLUSTER SLOTS`.
    pub async fn primary_changed(&self, endpoint: &Endpoint) -> RedisResult<()> {
        info!("Primary changed to {}, refreshing topology", endpoint);
        let mut last = self.refresh_lock.lock().await;
        self.reload(Some(endpoint.address())).await?;
        *last = Some(Instant::now());
        Ok(())
    }

    /// Send one command to the node owning its keys
    ///
    /// # Errors
    ///
    /// - [`RedisError::CrossSlot`] if the keys hash to different slots (nothing is sent)
    /// - [`RedisError::NodeUnreachable`] if the owning node cannot be reached
    /// - [`RedisError::RedirectExhausted`] once the retry policy gives up
    /// - the server's error reply otherwise
    pub async fn send(&self, cmd: &Cmd) -> RedisResult<RespValue> {
        let slot = command_slot(cmd)?;
        let mut attempts: u32 = 0;
        let mut ask_target: Option<String> = None;

        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let result = match ask_target.take() {
                Some(address) => self.send_asking(&address, cmd).await,
                None => match self.route(slot, cmd.is_read_only()).await {
                    Some((address, readonly)) => self.send_to(&address, readonly, cmd).await,
                    None => Err(RedisError::Cluster(format!(
                        "no node serves the slot of {}",
                        cmd.name()
                    ))),
                },
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempts += 1;

            match &err {
                RedisError::Moved { slot, .. } => {
                    let address = redirect_address(&err);
                    debug!("{} MOVED slot {} to {}", cmd.name(), slot, address);
                    self.patch_slot(*slot, &address).await;
                    self.refresh_after_redirect(epoch, Some(address)).await;
                }
                RedisError::Ask { slot, .. } => {
                    let address = redirect_address(&err);
                    debug!("{} ASK slot {} at {}", cmd.name(), slot, address);
                    ask_target = Some(address);
                }
                RedisError::Cluster(_) => self.refresh_after_redirect(epoch, None).await,
                e if e.is_cluster_transient() => debug!("{} hit {}, retrying", cmd.name(), e),
                _ => return Err(err),
            }

            let Some(delay) = self.retry.next_delay(attempts) else {
                warn!("{} gave up after {} cluster attempts", cmd.name(), attempts);
                return Err(RedisError::RedirectExhausted {
                    command: cmd.name().to_string(),
                    attempts,
                    source: Box::new(err),
                });
            };
            if !err.is_redirect() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Dedicated connection for a subscriber
    ///
    /// With a channel, the connection goes to the primary owning the
    /// channel's slot (needed for sharded channels); otherwise any primary.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be reached.
    pub async fn subscriber_connection(&self, channel: Option<&[u8]>) -> RedisResult<Connection> {
        let address = match channel {
            Some(channel) => self.route(Some(key_slot(channel)), false).await,
            None => self.route(None, false).await,
        }
        .map(|(address, _)| address)
        .ok_or_else(|| RedisError::Cluster("slot map is empty".to_string()))?;

        let endpoint = Endpoint::parse(&address)?;
        Connection::open(
            endpoint,
            Arc::clone(&self.node_config),
            Arc::clone(&self.connector),
            false,
            self.events.clone(),
        )
        .await
    }

    /// Send QUIT to every node connection
    pub async fn close(&self) {
        let nodes: Vec<Connection> = self.nodes.lock().await.drain().map(|(_, c)| c).collect();
        for node in nodes {
            node.quit().await;
        }
    }

    /// Pick the node for `slot`, honouring the read policy for read-only commands
    async fn route(&self, slot: Option<u16>, read_only: bool) -> Option<(String, bool)> {
        let map = self.slot_map().await;
        let Some(slot) = slot else {
            let primaries = map.primaries();
            if primaries.is_empty() {
                return None;
            }
            let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % primaries.len();
            return Some((primaries[index].to_string(), false));
        };

        let shard = map.shard_for_slot(slot)?;
        if read_only && self.read_policy != ReadPolicy::Primary && !shard.replicas.is_empty() {
            let mut candidates: Vec<(String, bool)> = shard
                .replicas
                .iter()
                .map(|replica| (replica.clone(), true))
                .collect();
            if self.read_policy == ReadPolicy::Any {
                candidates.push((shard.primary.clone(), false));
            }
            let start = self.round_robin.fetch_add(1, Ordering::Relaxed);
            for offset in 0..candidates.len() {
                let (address, readonly) = &candidates[(start + offset) % candidates.len()];
                if self.is_healthy(address, *readonly).await {
                    return Some((address.clone(), *readonly));
                }
            }
        }
        Some((shard.primary.clone(), false))
    }

    async fn is_healthy(&self, address: &str, readonly: bool) -> bool {
        let key = NodeKey {
            address: address.to_string(),
            readonly,
        };
        self.nodes.lock().await.get(&key).map_or(true, |conn| {
            !matches!(
                conn.state(),
                ConnectionState::Closed | ConnectionState::Reconnecting
            )
        })
    }

    /// Connection to `address`, opened on first use
    async fn node(&self, address: &str, readonly: bool) -> RedisResult<Connection> {
        let key = NodeKey {
            address: address.to_string(),
            readonly,
        };
        if let Some(conn) = self.nodes.lock().await.get(&key) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let endpoint = Endpoint::parse(address)?;
        let conn = Connection::open(
            endpoint,
            Arc::clone(&self.node_config),
            Arc::clone(&self.connector),
            readonly,
            self.events.clone(),
        )
        .await
        .map_err(|err| RedisError::NodeUnreachable {
            endpoint: address.to_string(),
            source: Box::new(err),
        })?;

        let mut nodes = self.nodes.lock().await;
        match nodes.get(&key) {
            Some(existing) if !existing.is_closed() => {
                // Lost the race to another caller
                conn.disconnect();
                Ok(existing.clone())
            }
            _ => {
                debug!("Opened connection to {} (readonly: {})", address, readonly);
                nodes.insert(key, conn.clone());
                Ok(conn)
            }
        }
    }

    async fn forget(&self, address: &str, readonly: bool) {
        let key = NodeKey {
            address: address.to_string(),
            readonly,
        };
        let mut nodes = self.nodes.lock().await;
        if nodes.get(&key).is_some_and(Connection::is_closed) {
            nodes.remove(&key);
        }
    }

    fn unreachable(address: &str, err: RedisError) -> RedisError {
        RedisError::NodeUnreachable {
            endpoint: address.to_string(),
            source: Box::new(err),
        }
    }

    async fn send_to(&self, address: &str, readonly: bool, cmd: &Cmd) -> RedisResult<RespValue> {
        let conn = self.node(address, readonly).await?;
        match conn.send(cmd).await {
            Err(err) if err.is_connection_error() => {
                self.forget(address, readonly).await;
                Err(Self::unreachable(address, err))
            }
            other => other,
        }
    }

    async fn send_group(
        &self,
        address: &str,
        payload: Bytes,
        expected: usize,
        command: String,
    ) -> RedisResult<RespValue> {
        let conn = self.node(address, false).await?;
        let reply = match conn.submit_group(payload, expected, command) {
            Ok(reply) => reply.await,
            Err(err) => Err(err),
        };
        match reply {
            Err(err) if err.is_connection_error() => {
                self.forget(address, false).await;
                Err(Self::unreachable(address, err))
            }
            other => other,
        }
    }

    /// ASKING and the command travel as one group so nothing lands between them
    async fn send_asking(&self, address: &str, cmd: &Cmd) -> RedisResult<RespValue> {
        let mut payload = BytesMut::new();
        Cmd::new("ASKING").write_frame(&mut payload);
        cmd.write_frame(&mut payload);
        let reply = self
            .send_group(address, payload.freeze(), 2, cmd.name().to_string())
            .await?;
        split_replies(reply, 2)?
            .pop()
            .unwrap_or_else(|| Err(RedisError::Protocol("missing reply after ASKING".into())))
    }

    async fn patch_slot(&self, slot: u16, address: &str) {
        let mut topology = self.topology.write().await;
        let patched = topology.with_slot_owner(slot, address);
        *topology = Arc::new(patched);
    }

    /// Refresh unless someone else already did since `observed_epoch`
    async fn refresh_after_redirect(&self, observed_epoch: u64, hint: Option<String>) {
        let mut last = self.refresh_lock.lock().await;
        if self.epoch.load(Ordering::Acquire) != observed_epoch {
            debug!("Topology already refreshed, reusing it");
            return;
        }
        let cooldown = self.node_config.cluster.refresh_cooldown;
        if last.is_some_and(|at| at.elapsed() < cooldown) {
            debug!("Skipping refresh inside the {:?} cooldown", cooldown);
            return;
        }
        if let Err(err) = self.reload(hint).await {
            warn!("Topology refresh failed: {}", err);
        }
        *last = Some(Instant::now());
    }

    /// Query candidates for `CLUSTER SLOTS` until one answers; caller holds the refresh lock
    async fn reload(&self, hint: Option<String>) -> RedisResult<()> {
        self.refreshes.fetch_add(1, Ordering::AcqRel);
        let current = self.slot_map().await;

        let mut candidates: Vec<String> = hint.into_iter().collect();
        candidates.extend(current.primaries().into_iter().map(str::to_string));
        candidates.extend(current.addresses());
        candidates.extend(self.seeds.iter().map(Endpoint::address));
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|address| seen.insert(address.clone()));

        let mut last_error = None;
        for address in candidates {
            match self.fetch_slots(&address).await {
                Ok(map) if !map.is_empty() => {
                    self.publish(map).await;
                    return Ok(());
                }
                Ok(_) => {
                    debug!("{} returned an empty slot map", address);
                    last_error = Some(RedisError::Cluster(format!(
                        "{address} returned no slots"
                    )));
                }
                Err(err) => {
                    debug!("CLUSTER SLOTS on {} failed: {}", address, err);
                    last_error = Some(err);
                }
            }
        }
        Err(RedisError::Cluster(format!(
            "no node answered CLUSTER SLOTS: {}",
            last_error.map_or_else(|| "no candidates".to_string(), |e| e.to_string())
        )))
    }

    async fn fetch_slots(&self, address: &str) -> RedisResult<SlotMap> {
        let conn = self.node(address, false).await?;
        let reply = conn.send(&Cmd::new("CLUSTER").arg("SLOTS")).await?;
        let host = match Endpoint::parse(address)? {
            Endpoint::Tcp { host, .. } => host,
            Endpoint::Unix(_) => address.to_string(),
        };
        SlotMap::from_cluster_slots(&reply, &host)
    }

    async fn publish(&self, map: SlotMap) {
        let map = Arc::new(map);
        let previous = {
            let mut topology = self.topology.write().await;
            std::mem::replace(&mut *topology, Arc::clone(&map))
        };
        self.epoch.fetch_add(1, Ordering::AcqRel);

        let before = previous.addresses();
        let after = map.addresses();
        for address in after.difference(&before) {
            self.events.emit(ConnectionEvent::NodeAdded {
                address: address.clone(),
            });
        }
        let removed: Vec<String> = before.difference(&after).cloned().collect();
        if !removed.is_empty() {
            let mut nodes = self.nodes.lock().await;
            for address in &removed {
                self.events.emit(ConnectionEvent::NodeRemoved {
                    address: address.clone(),
                });
                for readonly in [false, true] {
                    if let Some(conn) = nodes.remove(&NodeKey {
                        address: address.clone(),
                        readonly,
                    }) {
                        tokio::spawn(async move { conn.quit().await });
                    }
                }
            }
        }
        info!(
            "Slot map refreshed: {} primaries, {} nodes",
            map.primaries().len(),
            after.len()
        );
    }

    /// Node every keyed command of a batch routes to
    async fn batch_target(&self, commands: &[Cmd]) -> RedisResult<String> {
        let map = self.slot_map().await;
        let mut target: Option<String> = None;
        for command in commands {
            let Some(slot) = command_slot(command)? else {
                continue;
            };
            let owner = map
                .primary_for_slot(slot)
                .ok_or_else(|| RedisError::Cluster(format!("slot {slot} is not served")))?;
            match &target {
                None => target = Some(owner.to_string()),
                Some(existing) if existing != owner => {
                    return Err(RedisError::CrossSlot {
                        command: batch_name(commands),
                    });
                }
                Some(_) => {}
            }
        }
        match target {
            Some(target) => Ok(target),
            None => self
                .route(None, false)
                .await
                .map(|(address, _)| address)
                .ok_or_else(|| RedisError::Cluster("slot map is empty".to_string())),
        }
    }

    /// Send a batch to its node, following a MOVED that redirects it
    async fn send_batch(
        &self,
        commands: &[Cmd],
        payload: Bytes,
        expected: usize,
        command: String,
        whole_batch_moved: bool,
    ) -> RedisResult<RespValue> {
        let mut attempts: u32 = 0;
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let target = self.batch_target(commands).await?;
            let reply = self
                .send_group(&target, payload.clone(), expected, command.clone())
                .await?;

            let Some(moved) = moved_redirect(&reply, whole_batch_moved) else {
                return Ok(reply);
            };
            attempts += 1;
            if self.retry.next_delay(attempts).is_none() {
                return Err(RedisError::RedirectExhausted {
                    command,
                    attempts,
                    source: Box::new(moved),
                });
            }
            if let RedisError::Moved { slot, .. } = &moved {
                let address = redirect_address(&moved);
                debug!("{} MOVED slot {} to {}", command, slot, address);
                self.patch_slot(*slot, &address).await;
                self.refresh_after_redirect(epoch, Some(address)).await;
            }
        }
    }
}

fn redirect_address(err: &RedisError) -> String {
    err.redirect_target()
        .map(|(host, port)| Endpoint::tcp(host, port).address())
        .unwrap_or_default()
}

/// A MOVED carried by a batch reply
///
/// With `all` set, only a reply whose every frame is the same MOVED counts;
/// otherwise any MOVED frame does (a transaction aborted by one).
fn moved_redirect(reply: &RespValue, all: bool) -> Option<RedisError> {
    let RespValue::Array(frames) = reply else {
        return None;
    };
    let mut moved = frames.iter().map(|frame| match frame {
        RespValue::Error(msg) => RedisError::parse_redirect(msg)
            .filter(|err| matches!(err, RedisError::Moved { .. })),
        _ => None,
    });

    if all {
        let first = moved.next()??;
        let target = first.redirect_target();
        moved
            .all(|err| err.is_some_and(|err| err.redirect_target() == target))
            .then_some(first)
    } else {
        moved.flatten().next()
    }
}

#[async_trait]
impl PipelineExecutor for ClusterRouter {
    async fn execute_pipeline(
        &self,
        commands: &[Cmd],
    ) -> RedisResult<Vec<RedisResult<RespValue>>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .send_batch(
                commands,
                encode_batch(commands),
                commands.len(),
                batch_name(commands),
                true,
            )
            .await?;
        split_replies(reply, commands.len())
    }

    async fn execute_transaction(
        &self,
        commands: &[Cmd],
    ) -> RedisResult<Vec<RedisResult<RespValue>>> {
        let reply = self
            .send_batch(
                commands,
                encode_transaction(commands),
                commands.len() + 2,
                "MULTI".to_string(),
                false,
            )
            .await?;
        transaction_outcome(reply, commands.len())
    }
}
