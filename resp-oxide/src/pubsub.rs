//! Subscription multiplexer
//!
//! A connection that has issued a subscribe-class command enters subscriber
//! mode. From then on, inbound message frames are not replies: they are
//! routed to the listeners registered for the channel (or pattern) they name.
//! The set of subscriptions is recorded per connection, so a reconnect can
//! restore it before the connection is handed back to the caller.
//!
//! # Examples
//!
//! ```no_run
//! use resp_oxide::{Client, ConnectionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect(ConnectionConfig::new("redis://localhost:6379")).await?;
//! let mut subscriber = client.subscriber().await?;
//! subscriber.subscribe(vec!["news".to_string()]).await?;
//!
//! while let Some(message) = subscriber.next_message().await? {
//!     println!("{}: {}", message.channel_str(), message.payload_str());
//! }
//! # Ok(())
//! # }
//! ```

use crate::command::Cmd;
use crate::connection::Connection;
use bytes::Bytes;
use futures_util::Stream;
use resp_oxide_core::{error::RedisResult, value::RespValue};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// What a subscription is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKind {
    /// SUBSCRIBE
    Channel,
    /// PSUBSCRIBE
    Pattern,
    /// SSUBSCRIBE (sharded channels)
    Shard,
}

impl SubscriptionKind {
    /// All kinds, in resubscribe order
    pub const ALL: [Self; 3] = [Self::Channel, Self::Pattern, Self::Shard];

    /// Command that adds subscriptions of this kind
    #[must_use]
    pub const fn subscribe_command(self) -> &'static str {
        match self {
            Self::Channel => "SUBSCRIBE",
            Self::Pattern => "PSUBSCRIBE",
            Self::Shard => "SSUBSCRIBE",
        }
    }

    /// Command that removes subscriptions of this kind
    #[must_use]
    pub const fn unsubscribe_command(self) -> &'static str {
        match self {
            Self::Channel => "UNSUBSCRIBE",
            Self::Pattern => "PUNSUBSCRIBE",
            Self::Shard => "SUNSUBSCRIBE",
        }
    }

    /// Wire command for a change of this kind
    #[must_use]
    pub fn command(self, subscribe: bool, names: &[Bytes]) -> Cmd {
        let name = if subscribe {
            self.subscribe_command()
        } else {
            self.unsubscribe_command()
        };
        Cmd::new(name).args(names.iter().cloned())
    }
}

/// A message received from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Which subscription delivered the message
    pub kind: SubscriptionKind,
    /// The channel the message was received on
    pub channel: Bytes,
    /// The pattern that matched (for pattern subscriptions)
    pub pattern: Option<Bytes>,
    /// The message payload
    pub payload: Bytes,
}

impl PubSubMessage {
    /// Channel name as text
    #[must_use]
    pub fn channel_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.channel)
    }

    /// Payload as text
    #[must_use]
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

pub(crate) type Listener = mpsc::UnboundedSender<PubSubMessage>;

/// Subscription frames recognised on a connection in subscriber mode
#[derive(Debug)]
pub(crate) enum PubSubFrame {
    Message(PubSubMessage),
    Confirmation {
        kind: SubscriptionKind,
        subscribe: bool,
        name: Option<Bytes>,
        count: i64,
    },
}

/// Recognise message and confirmation frames (RESP3 pushes or RESP2 arrays)
pub(crate) fn classify(frame: &RespValue) -> Option<PubSubFrame> {
    let (RespValue::Array(items) | RespValue::Push(items)) = frame else {
        return None;
    };
    let marker = items.first()?.as_bytes().ok()?;
    let bytes_at = |i: usize| items.get(i).and_then(|item| item.as_bytes().ok());

    let message = |kind, channel: Option<Bytes>, pattern, payload: Option<Bytes>| {
        Some(PubSubFrame::Message(PubSubMessage {
            kind,
            channel: channel?,
            pattern,
            payload: payload?,
        }))
    };

    match (marker.as_ref(), items.len()) {
        (b"message", 3) => message(SubscriptionKind::Channel, bytes_at(1), None, bytes_at(2)),
        (b"smessage", 3) => message(SubscriptionKind::Shard, bytes_at(1), None, bytes_at(2)),
        (b"pmessage", 4) => message(
            SubscriptionKind::Pattern,
            bytes_at(2),
            bytes_at(1),
            bytes_at(3),
        ),
        (name, 3) => {
            let (kind, subscribe) = match name {
                b"subscribe" => (SubscriptionKind::Channel, true),
                b"psubscribe" => (SubscriptionKind::Pattern, true),
                b"ssubscribe" => (SubscriptionKind::Shard, true),
                b"unsubscribe" => (SubscriptionKind::Channel, false),
                b"punsubscribe" => (SubscriptionKind::Pattern, false),
                b"sunsubscribe" => (SubscriptionKind::Shard, false),
                _ => return None,
            };
            let count = items[2].as_int().ok()?;
            Some(PubSubFrame::Confirmation {
                kind,
                subscribe,
                name: bytes_at(1),
                count,
            })
        }
        _ => None,
    }
}

/// Active subscriptions of one connection and their listeners
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<SubscriptionKind, HashMap<Bytes, Vec<Listener>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn add(&mut self, kind: SubscriptionKind, name: Bytes, listener: Option<Listener>) {
        let listeners = self.entries.entry(kind).or_default().entry(name).or_default();
        if let Some(listener) = listener {
            if !listeners.iter().any(|l| l.same_channel(&listener)) {
                listeners.push(listener);
            }
        }
    }

    pub(crate) fn remove(&mut self, kind: SubscriptionKind, name: &[u8]) {
        if let Some(names) = self.entries.get_mut(&kind) {
            names.remove(name);
        }
    }

    /// Remove every subscription of `kind`, returning how many there were
    pub(crate) fn remove_all(&mut self, kind: SubscriptionKind) -> usize {
        self.entries.remove(&kind).map_or(0, |names| names.len())
    }

    pub(crate) fn count(&self, kind: SubscriptionKind) -> usize {
        self.entries.get(&kind).map_or(0, HashMap::len)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.values().all(HashMap::is_empty)
    }

    /// Names of `kind`, sorted so resubscription is deterministic
    pub(crate) fn names(&self, kind: SubscriptionKind) -> Vec<Bytes> {
        self.entries
            .get(&kind)
            .map(|names| names.keys().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    /// Hand a message to the listeners of its channel or pattern
    pub(crate) fn deliver(&mut self, message: PubSubMessage) {
        let key = match message.kind {
            SubscriptionKind::Pattern => message.pattern.clone().unwrap_or_default(),
            _ => message.channel.clone(),
        };
        let Some(listeners) = self
            .entries
            .get_mut(&message.kind)
            .and_then(|names| names.get_mut(&key))
        else {
            debug!(
                "Dropping message for {:?} without subscription",
                String::from_utf8_lossy(&key)
            );
            return;
        };
        listeners.retain(|listener| listener.send(message.clone()).is_ok());
    }
}

/// Receives messages for the channels and patterns it subscribes to
///
/// A subscriber owns a dedicated connection: while subscribed, that
/// connection only accepts subscription commands, PING, RESET and QUIT.
pub struct Subscriber {
    connection: Connection,
    listener: Listener,
    message_rx: mpsc::UnboundedReceiver<PubSubMessage>,
    subscribed: HashMap<SubscriptionKind, BTreeSet<Bytes>>,
}

impl Subscriber {
    /// Create a subscriber on `connection`
    pub fn new(connection: Connection) -> Self {
        let (listener, message_rx) = mpsc::unbounded_channel();
        Self {
            connection,
            listener,
            message_rx,
            subscribed: HashMap::new(),
        }
    }

    async fn change(
        &mut self,
        kind: SubscriptionKind,
        subscribe: bool,
        names: Vec<String>,
    ) -> RedisResult<()> {
        let names: Vec<Bytes> = names.into_iter().map(Bytes::from).collect();
        let listener = subscribe.then(|| self.listener.clone());
        self.connection
            .change_subscription(kind, subscribe, names.clone(), listener)
            .await?;

        let entry = self.subscribed.entry(kind).or_default();
        if subscribe {
            entry.extend(names);
        } else if names.is_empty() {
            entry.clear();
        } else {
            for name in &names {
                entry.remove(name);
            }
        }
        Ok(())
    }

    /// Subscribe to one or more channels
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the server rejects the subscription.
    pub async fn subscribe(&mut self, channels: Vec<String>) -> RedisResult<()> {
        self.change(SubscriptionKind::Channel, true, channels).await
    }

    /// Unsubscribe from channels; an empty list unsubscribes from all of them
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub async fn unsubscribe(&mut self, channels: Vec<String>) -> RedisResult<()> {
        self.change(SubscriptionKind::Channel, false, channels).await
    }

    /// Subscribe to one or more glob patterns
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the server rejects the subscription.
    pub async fn psubscribe(&mut self, patterns: Vec<String>) -> RedisResult<()> {
        self.change(SubscriptionKind::Pattern, true, patterns).await
    }

    /// Unsubscribe from patterns; an empty list unsubscribes from all of them
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub async fn punsubscribe(&mut self, patterns: Vec<String>) -> RedisResult<()> {
        self.change(SubscriptionKind::Pattern, false, patterns).await
    }

    /// Subscribe to sharded channels
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the server rejects the subscription.
    pub async fn ssubscribe(&mut self, channels: Vec<String>) -> RedisResult<()> {
        self.change(SubscriptionKind::Shard, true, channels).await
    }

    /// Unsubscribe from sharded channels
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub async fn sunsubscribe(&mut self, channels: Vec<String>) -> RedisResult<()> {
        self.change(SubscriptionKind::Shard, false, channels).await
    }

    /// Wait for the next message; `None` once the connection is gone
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for delivery errors.
    pub async fn next_message(&mut self) -> RedisResult<Option<PubSubMessage>> {
        Ok(self.message_rx.recv().await)
    }

    /// Get the next message with a timeout; `None` if nothing arrived in time
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for delivery errors.
    pub async fn next_message_timeout(
        &mut self,
        duration: Duration,
    ) -> RedisResult<Option<PubSubMessage>> {
        Ok(timeout(duration, self.message_rx.recv()).await.ok().flatten())
    }

    /// Get a list of currently subscribed channels
    #[must_use]
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.names(SubscriptionKind::Channel)
    }

    /// Get a list of currently subscribed patterns
    #[must_use]
    pub fn subscribed_patterns(&self) -> Vec<String> {
        self.names(SubscriptionKind::Pattern)
    }

    fn names(&self, kind: SubscriptionKind) -> Vec<String> {
        self.subscribed
            .get(&kind)
            .map(|names| {
                names
                    .iter()
                    .map(|name| String::from_utf8_lossy(name).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check if subscribed to a specific channel
    #[must_use]
    pub fn is_subscribed_to_channel(&self, channel: &str) -> bool {
        self.subscribed
            .get(&SubscriptionKind::Channel)
            .is_some_and(|names| names.contains(channel.as_bytes()))
    }

    /// The connection this subscriber owns
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Stream for Subscriber {
    type Item = RedisResult<PubSubMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.message_rx.poll_recv(cx).map(|message| message.map(Ok))
    }
}
