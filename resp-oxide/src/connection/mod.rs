//! Connection state machine
//!
//! A [`Connection`] is a cheap, cloneable handle to a driver task that owns
//! one transport. The driver takes the stream through connect, handshake and
//! ready states, writes queued commands in batches, and resolves each pending
//! request with the next decoded reply in strict FIFO order. Submitting a
//! command only enqueues it; the returned [`ReplyFuture`] is awaited
//! separately, so many callers can pipeline on one connection.

mod driver;
pub mod events;
pub mod transport;

pub use events::ConnectionEvent;
pub use transport::{BoxedTransport, Connector, SharedConnector, TcpConnector, Transport};

use crate::command::Cmd;
use crate::protocol::ProtocolNegotiation;
use crate::pubsub::{Listener, SubscriptionKind};
use bytes::Bytes;
use driver::Driver;
use events::EventEmitter;
use resp_oxide_core::{
    config::{ConnectionConfig, Endpoint},
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tracing::debug;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected; a lazy connection waits here for its first command
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Sending credentials
    Authenticating,
    /// Selecting the configured database
    SelectingNamespace,
    /// Accepting commands
    Ready,
    /// In subscriber mode
    Subscribed,
    /// Waiting out a backoff delay before the next connect attempt
    Reconnecting,
    /// Will not be used again
    Closed,
}

impl ConnectionState {
    /// Whether commands are written as soon as they are submitted
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::SelectingNamespace => "selecting-namespace",
            Self::Ready => "ready",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Subscribe or unsubscribe request carried alongside its wire frame
#[derive(Debug)]
pub(crate) struct SubscriptionChange {
    pub(crate) kind: SubscriptionKind,
    pub(crate) subscribe: bool,
    pub(crate) names: Vec<Bytes>,
    pub(crate) listener: Option<Listener>,
}

pub(crate) type ReplySender = oneshot::Sender<RedisResult<RespValue>>;

/// One unit of work for the driver: one or more frames answered in order
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) payload: Bytes,
    /// Reply frames this request consumes
    pub(crate) expected: usize,
    /// Resolve with every reply frame as an array instead of a single result
    pub(crate) grouped: bool,
    pub(crate) command: String,
    pub(crate) subscriber_safe: bool,
    pub(crate) subscription: Option<SubscriptionChange>,
    /// When the caller's command timeout fires
    pub(crate) deadline: Option<Instant>,
    pub(crate) tx: ReplySender,
}

impl Request {
    pub(crate) fn fail(self, error: RedisError) {
        let _ = self.tx.send(Err(error));
    }

    /// The caller already got a timeout, so the command need not be written
    ///
    /// A dropped reply future alone does not count: the command was
    /// submitted and still goes out, its reply is read and discarded.
    pub(crate) fn abandoned(&self) -> bool {
        self.tx.is_closed() && self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug)]
pub(crate) enum Message {
    Request(Request),
    Connect,
    Retarget(Endpoint),
    Quit(oneshot::Sender<()>),
    Disconnect,
}

struct Shared {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
    endpoint: watch::Receiver<Endpoint>,
    negotiation: watch::Receiver<Option<ProtocolNegotiation>>,
    events: EventEmitter,
    config: Arc<ConnectionConfig>,
}

/// Handle to one server connection
///
/// Clones share the same driver. The driver stops once every handle is
/// dropped and the requests already written have been answered.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Connect to `endpoint` over TCP or a Unix socket
    ///
    /// Unless `lazy_connect` is set, this waits until the connection is ready.
    /// Failed attempts are retried as long as the reconnect policy allows.
    ///
    /// # Errors
    ///
    /// Returns the last connect error once the reconnect policy gives up.
    pub async fn connect(endpoint: Endpoint, config: ConnectionConfig) -> RedisResult<Self> {
        Self::connect_with_connector(endpoint, config, Arc::new(TcpConnector)).await
    }

    /// Connect using a custom transport connector
    ///
    /// # Errors
    ///
    /// Returns the last connect error once the reconnect policy gives up.
    pub async fn connect_with_connector(
        endpoint: Endpoint,
        config: ConnectionConfig,
        connector: SharedConnector,
    ) -> RedisResult<Self> {
        Self::open(endpoint, Arc::new(config), connector, false, EventEmitter::new()).await
    }

    pub(crate) async fn open(
        endpoint: Endpoint,
        config: Arc<ConnectionConfig>,
        connector: SharedConnector,
        readonly: bool,
        events: EventEmitter,
    ) -> RedisResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (endpoint_tx, endpoint_rx) = watch::channel(endpoint.clone());
        let (negotiation_tx, negotiation) = watch::channel(None);
        let (first_tx, first_rx) = oneshot::channel();
        let lazy = config.lazy_connect;

        let driver = Driver::new(driver::DriverParts {
            endpoint,
            config: Arc::clone(&config),
            connector,
            readonly,
            rx,
            state_tx,
            endpoint_tx,
            negotiation_tx,
            events: events.clone(),
            first_connect: (!lazy).then_some(first_tx),
        });
        tokio::spawn(driver.run());

        let connection = Self {
            inner: Arc::new(Shared {
                tx,
                state,
                endpoint: endpoint_rx,
                negotiation,
                events,
                config,
            }),
        };

        if !lazy {
            first_rx.await.map_err(|_| connection.closed_error("driver stopped"))??;
        }
        Ok(connection)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Endpoint the connection is currently bound to
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.borrow().clone()
    }

    /// Result of the protocol negotiation of the current transport
    #[must_use]
    pub fn negotiation(&self) -> Option<ProtocolNegotiation> {
        self.inner.negotiation.borrow().clone()
    }

    /// Configuration the connection was opened with
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the connection has been closed for good
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Wait until the connection is ready (or subscribed)
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::ConnectionClosed`] if the connection closes first.
    pub async fn ready(&self) -> RedisResult<()> {
        if self.state() == ConnectionState::Disconnected {
            let _ = self.inner.tx.send(Message::Connect);
        }
        let mut state = self.inner.state.clone();
        let reached = state
            .wait_for(|s| s.is_connected() || *s == ConnectionState::Closed)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);
        if reached == ConnectionState::Closed {
            return Err(self.closed_error("connection closed"));
        }
        Ok(())
    }

    /// Enqueue a command; the returned future resolves with its reply
    ///
    /// Error replies resolve the future with an error.
    ///
    /// # Errors
    ///
    /// Fails immediately if the connection is closed, not ready with the
    /// offline queue disabled, or in subscriber mode and the command is not
    /// allowed there.
    pub fn submit(&self, cmd: &Cmd) -> RedisResult<ReplyFuture> {
        let subscription = (cmd.is_subscribe() || cmd.is_unsubscribe()).then(|| {
            SubscriptionChange {
                kind: subscription_kind(cmd.name()),
                subscribe: cmd.is_subscribe(),
                names: cmd.arguments().to_vec(),
                listener: None,
            }
        });
        self.enqueue(
            cmd.to_bytes(),
            1,
            subscription.is_some(),
            cmd.name().to_string(),
            cmd.allowed_in_subscriber_mode(),
            subscription,
        )
    }

    /// Send a command and wait for its reply
    ///
    /// # Errors
    ///
    /// Returns the server's error reply, a timeout, or a connection error.
    pub async fn send(&self, cmd: &Cmd) -> RedisResult<RespValue> {
        self.submit(cmd)?.await
    }

    /// Enqueue pre-encoded frames answered by `expected` replies, resolved as one array
    pub(crate) fn submit_group(
        &self,
        payload: Bytes,
        expected: usize,
        command: String,
    ) -> RedisResult<ReplyFuture> {
        self.enqueue(payload, expected, true, command, false, None)
    }

    pub(crate) async fn change_subscription(
        &self,
        kind: SubscriptionKind,
        subscribe: bool,
        names: Vec<Bytes>,
        listener: Option<Listener>,
    ) -> RedisResult<RespValue> {
        let cmd = kind.command(subscribe, &names);
        let change = SubscriptionChange {
            kind,
            subscribe,
            names,
            listener,
        };
        self.enqueue(
            cmd.to_bytes(),
            1,
            true,
            cmd.name().to_string(),
            true,
            Some(change),
        )?
        .await
    }

    fn enqueue(
        &self,
        payload: Bytes,
        expected: usize,
        grouped: bool,
        command: String,
        subscriber_safe: bool,
        subscription: Option<SubscriptionChange>,
    ) -> RedisResult<ReplyFuture> {
        let state = self.state();
        match state {
            ConnectionState::Closed => return Err(self.closed_error("connection closed")),
            ConnectionState::Subscribed if !subscriber_safe => {
                return Err(RedisError::Connection(format!(
                    "{command} is not allowed while the connection is in subscriber mode"
                )));
            }
            ConnectionState::Ready
            | ConnectionState::Subscribed
            | ConnectionState::Disconnected => {}
            _ if !self.inner.config.offline_queue => {
                return Err(RedisError::NotReady {
                    endpoint: self.endpoint().to_string(),
                });
            }
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        let deadline = self
            .inner
            .config
            .command_timeout
            .map(|timeout| Instant::now() + timeout);
        let request = Request {
            payload,
            expected,
            grouped,
            command: command.clone(),
            subscriber_safe,
            subscription,
            deadline,
            tx,
        };
        self.inner
            .tx
            .send(Message::Request(request))
            .map_err(|_| self.closed_error("connection closed"))?;

        Ok(ReplyFuture {
            rx,
            deadline: deadline.map(|deadline| Box::pin(tokio::time::sleep_until(deadline))),
            command,
            endpoint: self.endpoint(),
        })
    }

    /// Point the connection at a new endpoint, reconnecting immediately
    pub fn retarget(&self, endpoint: Endpoint) {
        debug!("Retargeting connection to {}", endpoint);
        let _ = self.inner.tx.send(Message::Retarget(endpoint));
    }

    /// Flush queued commands, send QUIT and close once every reply is in
    pub async fn quit(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.tx.send(Message::Quit(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Close immediately, failing everything pending with `ConnectionClosed`
    pub fn disconnect(&self) {
        let _ = self.inner.tx.send(Message::Disconnect);
    }

    pub(crate) fn emitter(&self) -> &EventEmitter {
        &self.inner.events
    }

    fn closed_error(&self, reason: &str) -> RedisError {
        RedisError::ConnectionClosed {
            endpoint: self.endpoint().to_string(),
            reason: reason.to_string(),
        }
    }
}

fn subscription_kind(name: &str) -> SubscriptionKind {
    match name.to_ascii_uppercase().as_str() {
        "PSUBSCRIBE" | "PUNSUBSCRIBE" => SubscriptionKind::Pattern,
        "SSUBSCRIBE" | "SUNSUBSCRIBE" => SubscriptionKind::Shard,
        _ => SubscriptionKind::Channel,
    }
}

/// Reply of one submitted request
///
/// With a command timeout configured, the future gives up after the timeout.
/// The request stays queued on the connection and its late reply is read
/// and discarded.
#[must_use = "futures do nothing unless awaited"]
pub struct ReplyFuture {
    rx: oneshot::Receiver<RedisResult<RespValue>>,
    deadline: Option<Pin<Box<Sleep>>>,
    command: String,
    endpoint: Endpoint,
}

impl fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("command", &self.command)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Future for ReplyFuture {
    type Output = RedisResult<RespValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Poll::Ready(result) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(result.unwrap_or_else(|_| {
                Err(RedisError::ConnectionClosed {
                    endpoint: this.endpoint.to_string(),
                    reason: "driver stopped".to_string(),
                })
            }));
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                // The driver sees the closed channel and drops the reply
                this.rx.close();
                return Poll::Ready(Err(RedisError::Timeout {
                    command: std::mem::take(&mut this.command),
                    endpoint: this.endpoint.to_string(),
                }));
            }
        }
        Poll::Pending
    }
}
