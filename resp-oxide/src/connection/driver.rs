//! The task that owns a connection's transport
//!
//! One loop per connection reads submitted requests and socket bytes. Writes
//! happen only here, so the order frames hit the wire is the order replies
//! are matched against the pending queue.

use super::events::{ConnectionEvent, EventEmitter};
use super::transport::{BoxedTransport, HandshakeIo, SharedConnector, READ_BUFFER_CAPACITY};
use super::{ConnectionState, Message, Request, SubscriptionChange};
use crate::command::Cmd;
use crate::protocol::{
    HelloOptions, ProtocolConnection, ProtocolNegotiation, ProtocolNegotiator, RespDecoder,
};
use crate::pubsub::{classify, PubSubFrame, SubscriptionKind, SubscriptionRegistry};
use bytes::{Bytes, BytesMut};
use resp_oxide_core::{
    config::{ConnectionConfig, Endpoint, ProtocolVersion},
    error::{RedisError, RedisResult},
    retry::RetryPolicy,
    value::RespValue,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Everything the handle side sets up before spawning the driver
pub(super) struct DriverParts {
    pub(super) endpoint: Endpoint,
    pub(super) config: Arc<ConnectionConfig>,
    pub(super) connector: SharedConnector,
    pub(super) readonly: bool,
    pub(super) rx: mpsc::UnboundedReceiver<Message>,
    pub(super) state_tx: watch::Sender<ConnectionState>,
    pub(super) endpoint_tx: watch::Sender<Endpoint>,
    pub(super) negotiation_tx: watch::Sender<Option<ProtocolNegotiation>>,
    pub(super) events: EventEmitter,
    pub(super) first_connect: Option<oneshot::Sender<RedisResult<()>>>,
}

/// A written request waiting for its reply frames
struct Pending {
    request: Request,
    expected: usize,
    received: Vec<RespValue>,
}

impl Pending {
    fn complete(self) {
        let Self {
            request,
            mut received,
            ..
        } = self;
        let result = if request.grouped {
            Ok(RespValue::Array(received))
        } else {
            received.pop().map_or_else(
                || Err(RedisError::Protocol("request completed without a reply".into())),
                RespValue::into_result,
            )
        };
        if request.tx.send(result).is_err() {
            trace!("Discarding reply to {}; caller gave up", request.command);
        }
    }
}

/// Non-request messages, handled after the batch they arrived with
enum Control {
    Connect,
    Retarget(Endpoint),
    Quit(oneshot::Sender<()>),
    Disconnect,
}

fn split(message: Message) -> Result<Request, Control> {
    match message {
        Message::Request(request) => Ok(request),
        Message::Connect => Err(Control::Connect),
        Message::Retarget(endpoint) => Err(Control::Retarget(endpoint)),
        Message::Quit(ack) => Err(Control::Quit(ack)),
        Message::Disconnect => Err(Control::Disconnect),
    }
}

/// Why a served transport was given up
enum Exit {
    /// Close for good
    Stop(String),
    /// Reconnect after the policy delay
    Dropped(RedisError),
    /// Reconnect to a new endpoint right away
    Retarget,
}

pub(super) struct Driver {
    endpoint: Endpoint,
    config: Arc<ConnectionConfig>,
    connector: SharedConnector,
    readonly: bool,
    rx: mpsc::UnboundedReceiver<Message>,
    state_tx: watch::Sender<ConnectionState>,
    endpoint_tx: watch::Sender<Endpoint>,
    negotiation_tx: watch::Sender<Option<ProtocolNegotiation>>,
    events: EventEmitter,
    first_connect: Option<oneshot::Sender<RedisResult<()>>>,
    offline: VecDeque<Request>,
    pending: VecDeque<Pending>,
    subscriptions: SubscriptionRegistry,
    decoder: RespDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    quit_ack: Option<oneshot::Sender<()>>,
    handles_gone: bool,
    /// Most recent connect failure, reported if the policy gives up
    last_error: Option<RedisError>,
    closing: bool,
}

impl Driver {
    pub(super) fn new(parts: DriverParts) -> Self {
        Self {
            endpoint: parts.endpoint,
            config: parts.config,
            connector: parts.connector,
            readonly: parts.readonly,
            rx: parts.rx,
            state_tx: parts.state_tx,
            endpoint_tx: parts.endpoint_tx,
            negotiation_tx: parts.negotiation_tx,
            events: parts.events,
            first_connect: parts.first_connect,
            offline: VecDeque::new(),
            pending: VecDeque::new(),
            subscriptions: SubscriptionRegistry::default(),
            decoder: RespDecoder::new(ProtocolVersion::Resp2),
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            quit_ack: None,
            handles_gone: false,
            last_error: None,
            closing: false,
        }
    }

    pub(super) async fn run(mut self) {
        if self.config.lazy_connect {
            if let Some(reason) = self.await_first_use().await {
                return self.finish(&reason);
            }
        }

        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let Some(delay) = self.config.reconnect.next_delay(attempt) else {
                    let reason = match &self.last_error {
                        Some(err) => {
                            format!("gave up after {} reconnect attempts: {err}", attempt - 1)
                        }
                        None => format!("gave up after {} reconnect attempts", attempt - 1),
                    };
                    return self.finish(&reason);
                };
                self.set_state(ConnectionState::Reconnecting);
                info!(
                    "Reconnecting to {} in {:?} (attempt {})",
                    self.endpoint, delay, attempt
                );
                self.events.emit(ConnectionEvent::Reconnecting {
                    endpoint: self.endpoint.clone(),
                    attempt,
                    delay,
                });
                if let Some(reason) = self.backoff(delay).await {
                    return self.finish(&reason);
                }
            }

            self.set_state(ConnectionState::Connecting);
            self.events.emit(ConnectionEvent::Connecting {
                endpoint: self.endpoint.clone(),
                attempt,
            });
            match self.establish().await {
                Ok(stream) => {
                    attempt = 0;
                    self.last_error = None;
                    if let Some(first) = self.first_connect.take() {
                        let _ = first.send(Ok(()));
                    }
                    self.events.emit(ConnectionEvent::Connected {
                        endpoint: self.endpoint.clone(),
                    });
                    match self.serve(stream).await {
                        Exit::Stop(reason) => return self.finish(&reason),
                        Exit::Retarget => self.on_drop("retargeted"),
                        Exit::Dropped(err) => {
                            warn!("Connection to {} lost: {}", self.endpoint, err);
                            if matches!(err, RedisError::Protocol(_)) {
                                self.events.emit(ConnectionEvent::Error {
                                    endpoint: self.endpoint.clone(),
                                    message: err.to_string(),
                                });
                            }
                            self.on_drop(&err.to_string());
                            attempt = 1;
                        }
                    }
                }
                Err(err) => {
                    warn!("Failed to connect to {}: {}", self.endpoint, err);
                    self.events.emit(ConnectionEvent::Error {
                        endpoint: self.endpoint.clone(),
                        message: err.to_string(),
                    });
                    self.last_error = Some(err);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("{}: {} -> {}", self.endpoint, previous, state);
        }
    }

    fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = endpoint.clone();
        self.endpoint_tx.send_replace(endpoint);
    }

    fn closed(&self, reason: &str) -> RedisError {
        RedisError::ConnectionClosed {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    fn has_live_offline(&self) -> bool {
        self.offline.iter().any(|request| !request.abandoned())
    }

    /// Lazy connections stay disconnected until something is submitted
    async fn await_first_use(&mut self) -> Option<String> {
        loop {
            let Some(message) = self.rx.recv().await else {
                return Some("all handles dropped".to_string());
            };
            match split(message) {
                Ok(request) => {
                    self.offline.push_back(request);
                    return None;
                }
                Err(Control::Connect) => return None,
                Err(control) => {
                    if let Some(reason) = self.on_offline_control(control) {
                        return Some(reason);
                    }
                }
            }
        }
    }

    /// Sleep out a reconnect delay while queueing or rejecting submissions
    async fn backoff(&mut self, delay: Duration) -> Option<String> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            if self.handles_gone && !self.has_live_offline() {
                return Some("all handles dropped".to_string());
            }
            tokio::select! {
                () = &mut sleep => return None,
                message = self.rx.recv(), if !self.handles_gone => {
                    let Some(message) = message else {
                        self.handles_gone = true;
                        continue;
                    };
                    match split(message) {
                        Ok(request) => self.queue_offline(request),
                        Err(control) => {
                            if let Some(reason) = self.on_offline_control(control) {
                                return Some(reason);
                            }
                        }
                    }
                }
            }
        }
    }

    fn queue_offline(&mut self, request: Request) {
        if self.config.offline_queue {
            self.offline.push_back(request);
        } else {
            let endpoint = self.endpoint.to_string();
            request.fail(RedisError::NotReady { endpoint });
        }
    }

    fn on_offline_control(&mut self, control: Control) -> Option<String> {
        match control {
            Control::Connect => None,
            Control::Retarget(endpoint) => {
                self.set_endpoint(endpoint);
                None
            }
            Control::Quit(ack) => {
                self.quit_ack = Some(ack);
                Some("quit".to_string())
            }
            Control::Disconnect => Some("disconnected by client".to_string()),
        }
    }

    fn begin_closing(&mut self, reason: &str) {
        if !self.closing {
            self.closing = true;
            self.events.emit(ConnectionEvent::Closing {
                endpoint: self.endpoint.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// Open the transport and run the handshake, both under the connect timeout
    async fn establish(&mut self) -> RedisResult<BoxedTransport> {
        let connect_timeout = self.config.connect_timeout;
        let endpoint = self.endpoint.clone();
        let timed_out = || {
            RedisError::Connection(format!(
                "Connecting to {endpoint} timed out after {connect_timeout:?}"
            ))
        };

        let connector = Arc::clone(&self.connector);
        let stream = timeout(
            connect_timeout,
            connector.connect(&self.endpoint, &self.config),
        )
        .await
        .map_err(|_| timed_out())??;

        let mut io = HandshakeIo::new(stream);
        timeout(connect_timeout, self.handshake(&mut io))
            .await
            .map_err(|_| timed_out())??;

        let (stream, decoder, read_buf) = io.into_parts();
        self.decoder = decoder;
        self.read_buf = read_buf;
        Ok(stream)
    }

    async fn handshake(&mut self, io: &mut HandshakeIo) -> RedisResult<()> {
        let config = Arc::clone(&self.config);
        if config.has_credentials() {
            self.set_state(ConnectionState::Authenticating);
        }
        let negotiation = ProtocolNegotiator::new(config.protocol_version)
            .negotiate(
                io,
                HelloOptions {
                    username: config.username.as_deref(),
                    password: config.password.as_deref(),
                    client_name: config.client_name.as_deref(),
                },
            )
            .await?;

        if config.database != 0 {
            self.set_state(ConnectionState::SelectingNamespace);
            io.request("SELECT", &[Bytes::from(config.database.to_string())])
                .await?
                .into_result()?;
        }

        if let Some(name) = config.client_name.as_deref() {
            if !negotiation.client_name_set {
                let args = [Bytes::from_static(b"SETNAME"), Bytes::copy_from_slice(name.as_bytes())];
                io.request("CLIENT", &args).await?.into_result()?;
            }
        }

        if self.readonly {
            io.request("READONLY", &[]).await?.into_result()?;
        }

        self.resubscribe(io).await?;
        debug!(
            "Handshake with {} complete ({})",
            self.endpoint, negotiation.version
        );
        self.negotiation_tx.send_replace(Some(negotiation));
        Ok(())
    }

    /// Re-issue every recorded subscription before the connection is handed back
    async fn resubscribe(&mut self, io: &mut HandshakeIo) -> RedisResult<()> {
        for kind in SubscriptionKind::ALL {
            let names = self.subscriptions.names(kind);
            if names.is_empty() {
                continue;
            }
            info!(
                "Restoring {} {} subscriptions on {}",
                names.len(),
                kind.subscribe_command(),
                self.endpoint
            );
            let mut frame = BytesMut::new();
            kind.command(true, &names).write_frame(&mut frame);
            io.write_raw(&frame).await?;

            let mut confirmed = 0;
            while confirmed < names.len() {
                let frame = io.read_frame().await?;
                match classify(&frame) {
                    Some(PubSubFrame::Confirmation {
                        subscribe: true, ..
                    }) => confirmed += 1,
                    Some(PubSubFrame::Message(message)) => self.subscriptions.deliver(message),
                    _ => match frame {
                        RespValue::Error(msg) => return Err(RedisError::from_server_message(msg)),
                        other => trace!("Ignoring {} frame while resubscribing", other.kind()),
                    },
                }
            }
        }
        Ok(())
    }

    async fn serve(&mut self, mut stream: BoxedTransport) -> Exit {
        let state = if self.subscriptions.is_empty() {
            ConnectionState::Ready
        } else {
            ConnectionState::Subscribed
        };
        self.set_state(state);
        info!("Connected to {}", self.endpoint);

        // Everything queued while offline goes out first, in one write
        let (expired, queued): (Vec<Request>, Vec<Request>) =
            self.offline.drain(..).partition(Request::abandoned);
        if !expired.is_empty() {
            debug!(
                "Dropping {} offline commands that timed out before {} was ready",
                expired.len(),
                self.endpoint
            );
        }
        if !queued.is_empty() {
            debug!(
                "Flushing {} offline commands to {}",
                queued.len(),
                self.endpoint
            );
        }
        if let Err(err) = self.write_requests(&mut stream, queued).await {
            return Exit::Dropped(err);
        }
        if let Err(err) = self.drain_frames() {
            return Exit::Dropped(err);
        }

        loop {
            if (self.handles_gone || self.quit_ack.is_some()) && self.pending.is_empty() {
                let reason = if self.quit_ack.is_some() {
                    "quit"
                } else {
                    "all handles dropped"
                };
                return Exit::Stop(reason.to_string());
            }

            tokio::select! {
                message = self.rx.recv(), if !self.handles_gone && self.quit_ack.is_none() => {
                    match message {
                        None => self.handles_gone = true,
                        Some(message) => match self.on_message(&mut stream, message).await {
                            Ok(None) => {}
                            Ok(Some(exit)) => return exit,
                            Err(err) => return Exit::Dropped(err),
                        },
                    }
                }
                read = stream.read_buf(&mut self.read_buf) => {
                    match read {
                        Ok(0) if self.quit_ack.is_some() => return Exit::Stop("quit".to_string()),
                        Ok(0) => {
                            return Exit::Dropped(RedisError::Connection(
                                "connection closed by server".to_string(),
                            ));
                        }
                        Ok(_) => {
                            if let Err(err) = self.drain_frames() {
                                return Exit::Dropped(err);
                            }
                        }
                        Err(err) => return Exit::Dropped(err.into()),
                    }
                }
            }
        }
    }

    /// Collect whatever else is already queued behind `first` into one flush group
    async fn on_message(
        &mut self,
        stream: &mut BoxedTransport,
        first: Message,
    ) -> RedisResult<Option<Exit>> {
        let mut batch = Vec::new();
        let mut control = None;
        match split(first) {
            Ok(request) => batch.push(request),
            Err(c) => control = Some(c),
        }
        self.drain_ready(&mut batch, &mut control);

        let auto = self.config.auto_pipeline;
        if auto.enabled && control.is_none() && !batch.is_empty() {
            // Let other tasks finish submitting before the flush
            let started = Instant::now();
            while batch.len() < auto.max_batch
                && started.elapsed() < auto.window
                && !self.handles_gone
            {
                tokio::task::yield_now().await;
                let before = batch.len();
                self.drain_ready(&mut batch, &mut control);
                if control.is_some() || batch.len() == before {
                    break;
                }
            }
        }

        self.write_requests(stream, batch).await?;

        match control {
            None | Some(Control::Connect) => Ok(None),
            Some(Control::Retarget(endpoint)) => {
                info!("Retargeting {} to {}", self.endpoint, endpoint);
                self.set_endpoint(endpoint);
                Ok(Some(Exit::Retarget))
            }
            Some(Control::Quit(ack)) => {
                self.begin_closing("quit");
                self.send_quit(stream).await?;
                self.quit_ack = Some(ack);
                Ok(None)
            }
            Some(Control::Disconnect) => Ok(Some(Exit::Stop("disconnected by client".to_string()))),
        }
    }

    fn drain_ready(&mut self, batch: &mut Vec<Request>, control: &mut Option<Control>) {
        while control.is_none() {
            match self.rx.try_recv() {
                Ok(message) => match split(message) {
                    Ok(request) => batch.push(request),
                    Err(c) => *control = Some(c),
                },
                Err(TryRecvError::Disconnected) => {
                    self.handles_gone = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    async fn send_quit(&mut self, stream: &mut BoxedTransport) -> RedisResult<()> {
        let payload = Cmd::new("QUIT").to_bytes();
        // Nobody waits on the QUIT reply itself
        let (tx, _) = oneshot::channel();
        stream.write_all(&payload).await?;
        self.pending.push_back(Pending {
            request: Request {
                payload,
                expected: 1,
                grouped: false,
                command: "QUIT".to_string(),
                subscriber_safe: true,
                subscription: None,
                deadline: None,
                tx,
            },
            expected: 1,
            received: Vec::new(),
        });
        Ok(())
    }

    /// Write a flush group with a single `write_all`
    async fn write_requests(
        &mut self,
        stream: &mut BoxedTransport,
        batch: Vec<Request>,
    ) -> RedisResult<()> {
        self.write_buf.clear();
        let mut written = 0usize;
        for request in batch {
            if self.state() == ConnectionState::Subscribed && !request.subscriber_safe {
                let command = request.command.clone();
                request.fail(RedisError::Connection(format!(
                    "{command} is not allowed while the connection is in subscriber mode"
                )));
                continue;
            }
            let expected = match &request.subscription {
                Some(change) => self.apply_subscription(change),
                None => request.expected,
            };
            self.write_buf.extend_from_slice(&request.payload);
            self.pending.push_back(Pending {
                request,
                expected,
                received: Vec::new(),
            });
            written += 1;
        }

        if written == 0 {
            return Ok(());
        }
        trace!(
            "Writing {} requests ({} bytes) to {}",
            written,
            self.write_buf.len(),
            self.endpoint
        );
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Record a subscription change; returns how many confirmations it yields
    fn apply_subscription(&mut self, change: &SubscriptionChange) -> usize {
        if change.subscribe {
            for name in &change.names {
                self.subscriptions
                    .add(change.kind, name.clone(), change.listener.clone());
            }
            if self.state() == ConnectionState::Ready {
                self.set_state(ConnectionState::Subscribed);
            }
            return change.names.len();
        }

        if change.names.is_empty() {
            // One confirmation per removed name, or a single one if there were none
            return self.subscriptions.remove_all(change.kind).max(1);
        }
        for name in &change.names {
            self.subscriptions.remove(change.kind, name);
        }
        change.names.len()
    }

    fn drain_frames(&mut self) -> RedisResult<()> {
        while let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
            self.on_frame(frame)?;
        }
        Ok(())
    }

    fn head_is_subscription(&self) -> bool {
        self.pending
            .front()
            .is_some_and(|pending| pending.request.subscription.is_some())
    }

    fn on_frame(&mut self, frame: RespValue) -> RedisResult<()> {
        let is_push = frame.is_push();
        let pubsub_context = is_push
            || (matches!(frame, RespValue::Array(_))
                && (self.state() == ConnectionState::Subscribed || self.head_is_subscription()));

        if pubsub_context {
            match classify(&frame) {
                Some(PubSubFrame::Message(message)) => {
                    self.subscriptions.deliver(message);
                    return Ok(());
                }
                Some(PubSubFrame::Confirmation {
                    kind,
                    subscribe,
                    name,
                    count,
                }) => {
                    trace!(
                        "{} confirmation on {}, {} active",
                        if subscribe {
                            kind.subscribe_command()
                        } else {
                            kind.unsubscribe_command()
                        },
                        self.endpoint,
                        count
                    );
                    self.on_confirmation(kind, subscribe, name, frame);
                    return Ok(());
                }
                None if is_push => {
                    trace!("Ignoring push frame on {}", self.endpoint);
                    return Ok(());
                }
                None => {}
            }
        }

        let Some(head) = self.pending.front_mut() else {
            return Err(RedisError::Protocol(format!(
                "{} reply with no pending request",
                frame.kind()
            )));
        };
        if head.request.subscription.is_some() && frame.is_error() {
            if let Some(pending) = self.pending.pop_front() {
                let result = frame.into_result();
                let _ = pending.request.tx.send(result);
            }
            return Ok(());
        }
        head.received.push(frame);
        if head.received.len() >= head.expected {
            if let Some(pending) = self.pending.pop_front() {
                pending.complete();
            }
        }
        Ok(())
    }

    fn on_confirmation(
        &mut self,
        kind: SubscriptionKind,
        subscribe: bool,
        name: Option<Bytes>,
        frame: RespValue,
    ) {
        if self.head_is_subscription() {
            if let Some(head) = self.pending.front_mut() {
                head.received.push(frame);
                if head.received.len() >= head.expected {
                    if let Some(pending) = self.pending.pop_front() {
                        pending.complete();
                    }
                }
            }
        } else if !subscribe {
            // The server dropped the subscription on its own (slot migration)
            if let Some(name) = name {
                debug!(
                    "Server ended {} subscription to {:?}",
                    kind.subscribe_command(),
                    String::from_utf8_lossy(&name)
                );
                self.subscriptions.remove(kind, &name);
            }
        }

        if !subscribe
            && self.subscriptions.is_empty()
            && self.state() == ConnectionState::Subscribed
        {
            self.set_state(ConnectionState::Ready);
        }
    }

    /// Fail (or requeue) everything written on the lost transport, in FIFO order
    fn on_drop(&mut self, reason: &str) {
        self.decoder.reset();
        self.read_buf.clear();
        self.events.emit(ConnectionEvent::Disconnected {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        });

        let mut requeue = Vec::new();
        while let Some(pending) = self.pending.pop_front() {
            let Pending {
                request, received, ..
            } = pending;
            if request.subscription.is_some() {
                // The registry restores it on reconnect
                let _ = request.tx.send(Ok(RespValue::Array(received)));
            } else if self.config.resend_unfulfilled
                && received.is_empty()
                && !request.abandoned()
            {
                requeue.push(request);
            } else {
                request.fail(self.closed(reason));
            }
        }
        if !requeue.is_empty() {
            debug!(
                "Requeueing {} unfulfilled commands for {}",
                requeue.len(),
                self.endpoint
            );
        }
        for request in requeue.into_iter().rev() {
            self.offline.push_front(request);
        }
    }

    fn finish(mut self, reason: &str) {
        self.begin_closing(reason);
        self.set_state(ConnectionState::Closed);
        info!("Connection to {} closed: {}", self.endpoint, reason);

        while let Some(pending) = self.pending.pop_front() {
            pending.request.fail(self.closed(reason));
        }
        while let Some(request) = self.offline.pop_front() {
            request.fail(self.closed(reason));
        }
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            match message {
                Message::Request(request) => request.fail(self.closed(reason)),
                Message::Quit(ack) => {
                    let _ = ack.send(());
                }
                _ => {}
            }
        }
        if let Some(ack) = self.quit_ack.take() {
            let _ = ack.send(());
        }
        if let Some(first) = self.first_connect.take() {
            let error = self.last_error.take().unwrap_or_else(|| self.closed(reason));
            let _ = first.send(Err(error));
        }
        self.events.emit(ConnectionEvent::End {
            endpoint: self.endpoint.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Connection, Connector};
    use super::*;
    use crate::command::cmd;
    use crate::pubsub::Subscriber;
    use async_trait::async_trait;
    use resp_oxide_core::retry::{FixedDelay, NoRetry, SharedRetryPolicy};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    /// Counts `poll_write` calls so tests can see flush groups
    struct CountingStream {
        inner: DuplexStream,
        writes: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Hands out pre-made in-memory transports, one per connect
    #[derive(Debug, Default)]
    struct DuplexConnector {
        streams: Mutex<VecDeque<DuplexStream>>,
        connects: AtomicUsize,
        /// Connect attempts to refuse before handing out streams
        refusals: AtomicUsize,
        writes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(
            &self,
            _endpoint: &Endpoint,
            _config: &ConnectionConfig,
        ) -> RedisResult<BoxedTransport> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(RedisError::Connection("connection refused".into()));
            }
            let stream = self.streams.lock().unwrap().pop_front();
            stream
                .map(|inner| {
                    Box::new(CountingStream {
                        inner,
                        writes: Arc::clone(&self.writes),
                    }) as BoxedTransport
                })
                .ok_or_else(|| RedisError::Connection("connection refused".into()))
        }
    }

    struct Server {
        stream: DuplexStream,
        decoder: RespDecoder,
        buf: BytesMut,
    }

    impl Server {
        async fn command(&mut self) -> Vec<String> {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return frame
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|arg| arg.as_string().unwrap())
                        .collect();
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "client closed the stream");
            }
        }

        async fn reply(&mut self, raw: &[u8]) {
            self.stream.write_all(raw).await.unwrap();
        }
    }

    fn setup(count: usize) -> (Arc<DuplexConnector>, VecDeque<Server>) {
        let connector = Arc::new(DuplexConnector::default());
        let mut servers = VecDeque::new();
        for _ in 0..count {
            let (client, server) = duplex(64 * 1024);
            connector.streams.lock().unwrap().push_back(client);
            servers.push_back(Server {
                stream: server,
                decoder: RespDecoder::new(ProtocolVersion::Resp2),
                buf: BytesMut::new(),
            });
        }
        (connector, servers)
    }

    fn endpoint() -> Endpoint {
        Endpoint::tcp("127.0.0.1", 6379)
    }

    fn quick_retry(attempts: u32) -> SharedRetryPolicy {
        SharedRetryPolicy::new(FixedDelay {
            delay: Duration::from_millis(10),
            max_attempts: attempts,
        })
    }

    async fn open(config: ConnectionConfig, connector: Arc<DuplexConnector>) -> Connection {
        Connection::connect_with_connector(endpoint(), config, connector)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pipelined_replies_resolve_in_order() {
        let (connector, mut servers) = setup(1);
        let conn = open(ConnectionConfig::default(), connector).await;
        let mut server = servers.pop_front().unwrap();

        let set = conn.submit(&cmd("SET").arg("k").arg("v")).unwrap();
        let get = conn.submit(&cmd("GET").arg("k")).unwrap();
        assert_eq!(server.command().await, ["SET", "k", "v"]);
        assert_eq!(server.command().await, ["GET", "k"]);
        server.reply(b"+OK\r\n$1\r\nv\r\n").await;

        assert_eq!(set.await.unwrap(), RespValue::SimpleString("OK".into()));
        assert_eq!(get.await.unwrap(), RespValue::BulkString(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_one_write_per_flush_group() {
        let (connector, mut servers) = setup(1);
        let config = ConnectionConfig::default().with_auto_pipeline(
            resp_oxide_core::config::AutoPipelineConfig {
                enabled: true,
                ..Default::default()
            },
        );
        let conn = open(config, Arc::clone(&connector)).await;
        let mut server = servers.pop_front().unwrap();

        let mut tasks = Vec::new();
        for i in 0..10_i64 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                conn.send(&cmd("INCRBY").arg("n").arg(i)).await
            }));
        }
        for i in 0..10 {
            let expected = vec!["INCRBY".to_string(), "n".to_string(), i.to_string()];
            assert_eq!(server.command().await, expected);
        }
        assert_eq!(connector.writes.load(Ordering::SeqCst), 1);

        let replies: String = (0..10).map(|i| format!(":{i}\r\n")).collect();
        server.reply(replies.as_bytes()).await;
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), RespValue::Integer(i as i64));
        }
    }

    #[tokio::test]
    async fn test_error_reply_is_isolated() {
        let (connector, mut servers) = setup(1);
        let conn = open(ConnectionConfig::default(), connector).await;
        let mut server = servers.pop_front().unwrap();

        let bad = conn.submit(&cmd("INCR").arg("s")).unwrap();
        let good = conn.submit(&cmd("GET").arg("s")).unwrap();
        server.command().await;
        server.command().await;
        server
            .reply(b"-ERR value is not an integer\r\n$3\r\nabc\r\n")
            .await;

        assert!(matches!(bad.await, Err(RedisError::Server(_))));
        assert_eq!(good.await.unwrap(), RespValue::BulkString(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_drop_fails_pending_in_fifo_order_before_reconnect() {
        let (connector, mut servers) = setup(1);
        let config = ConnectionConfig::default().with_reconnect(SharedRetryPolicy::new(FixedDelay {
            delay: Duration::from_secs(60),
            max_attempts: 1,
        }));
        let conn = open(config, connector).await;
        let mut events = conn.events();
        let mut server = servers.pop_front().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut futures = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let reply = conn.submit(&cmd("GET").arg(i as i64)).unwrap();
            futures.push(reply);
        }
        for _ in 0..3 {
            server.command().await;
        }
        for (i, reply) in futures.into_iter().enumerate() {
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let result = reply.await;
                order.lock().unwrap().push(i);
                result
            }));
        }
        tokio::task::yield_now().await;
        drop(server);

        loop {
            if let ConnectionEvent::Reconnecting { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(RedisError::ConnectionClosed { .. })));
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_timeout_discards_late_reply() {
        let (connector, mut servers) = setup(1);
        let config =
            ConnectionConfig::default().with_command_timeout(Duration::from_millis(50));
        let conn = open(config, connector).await;
        let mut server = servers.pop_front().unwrap();

        let slow = conn.submit(&cmd("GET").arg("a")).unwrap();
        server.command().await;
        assert!(matches!(slow.await, Err(RedisError::Timeout { .. })));

        let next = conn.submit(&cmd("GET").arg("b")).unwrap();
        server.command().await;
        server.reply(b"$1\r\na\r\n$1\r\nb\r\n").await;
        assert_eq!(next.await.unwrap(), RespValue::BulkString(Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn test_dropped_reply_future_is_still_written() {
        let (connector, mut servers) = setup(1);
        let conn = open(ConnectionConfig::default(), connector).await;
        let mut server = servers.pop_front().unwrap();

        drop(conn.submit(&cmd("SET").arg("k").arg("v")).unwrap());
        let get = conn.submit(&cmd("GET").arg("k")).unwrap();
        assert_eq!(server.command().await, ["SET", "k", "v"]);
        assert_eq!(server.command().await, ["GET", "k"]);
        server.reply(b"+OK\r\n$1\r\nv\r\n").await;
        assert_eq!(get.await.unwrap(), RespValue::BulkString(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_offline_command_without_waiter_is_flushed() {
        let (connector, mut servers) = setup(1);
        let config = ConnectionConfig::default().with_lazy_connect(true);
        let conn = open(config, connector).await;

        drop(conn.submit(&cmd("INCR").arg("hits")).unwrap());
        let mut server = servers.pop_front().unwrap();
        assert_eq!(server.command().await, ["INCR", "hits"]);
        server.reply(b":1\r\n").await;

        let ping = conn.submit(&cmd("PING")).unwrap();
        assert_eq!(server.command().await, ["PING"]);
        server.reply(b"+PONG\r\n").await;
        assert_eq!(ping.await.unwrap(), RespValue::SimpleString("PONG".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_offline_command_is_not_written() {
        let (connector, mut servers) = setup(2);
        let config = ConnectionConfig::default()
            .with_command_timeout(Duration::from_millis(150))
            .with_reconnect(SharedRetryPolicy::new(FixedDelay {
                delay: Duration::from_millis(200),
                max_attempts: 3,
            }));
        let conn = open(config, connector).await;
        let mut events = conn.events();
        drop(servers.pop_front());

        loop {
            if let ConnectionEvent::Reconnecting { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        let stale = conn.submit(&cmd("GET").arg("stale")).unwrap();
        assert!(matches!(stale.await, Err(RedisError::Timeout { .. })));

        let fresh = conn.submit(&cmd("GET").arg("fresh")).unwrap();
        let mut server = servers.pop_front().unwrap();
        assert_eq!(server.command().await, ["GET", "fresh"]);
        server.reply(b"$1\r\nf\r\n").await;
        assert_eq!(fresh.await.unwrap(), RespValue::BulkString(Bytes::from_static(b"f")));
    }

    #[tokio::test]
    async fn test_eager_connect_retries_per_policy() {
        let (connector, _servers) = setup(1);
        connector.refusals.store(1, Ordering::SeqCst);
        let config = ConnectionConfig::default().with_reconnect(quick_retry(3));

        let conn = open(config, Arc::clone(&connector)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_eager_connect_fails_once_policy_gives_up() {
        let (connector, _servers) = setup(1);
        connector.refusals.store(10, Ordering::SeqCst);
        let config = ConnectionConfig::default().with_reconnect(quick_retry(2));

        let result =
            Connection::connect_with_connector(endpoint(), config, Arc::<DuplexConnector>::clone(&connector)).await;
        assert!(matches!(result, Err(RedisError::Connection(msg)) if msg == "connection refused"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let (connector, mut servers) = setup(1);
        let config = ConnectionConfig::default().with_lazy_connect(true);
        let conn = open(config, connector).await;
        let mut events = conn.events();
        let mut server = servers.pop_front().unwrap();

        let ping = conn.submit(&cmd("PING")).unwrap();
        assert_eq!(server.command().await, ["PING"]);
        server.reply(b"+PONG\r\n").await;
        ping.await.unwrap();
        let (_, ()) = tokio::join!(conn.quit(), async {
            assert_eq!(server.command().await, ["QUIT"]);
            server.reply(b"+OK\r\n").await;
        });

        let endpoint = endpoint();
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let end = matches!(event, ConnectionEvent::End { .. });
            seen.push(event);
            if end {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::Connecting {
                    endpoint: endpoint.clone(),
                    attempt: 0,
                },
                ConnectionEvent::Connected {
                    endpoint: endpoint.clone(),
                },
                ConnectionEvent::Closing {
                    endpoint: endpoint.clone(),
                    reason: "quit".to_string(),
                },
                ConnectionEvent::End { endpoint },
            ]
        );
    }

    #[tokio::test]
    async fn test_not_ready_without_offline_queue() {
        let (connector, mut servers) = setup(1);
        let config = ConnectionConfig::default()
            .with_offline_queue(false)
            .with_reconnect(SharedRetryPolicy::new(FixedDelay {
                delay: Duration::from_secs(60),
                max_attempts: 1,
            }));
        let conn = open(config, connector).await;
        let mut events = conn.events();
        drop(servers.pop_front());

        loop {
            if let ConnectionEvent::Reconnecting { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(matches!(
            conn.submit(&cmd("PING")),
            Err(RedisError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_lazy_connect_queues_until_first_command() {
        let (connector, mut servers) = setup(1);
        let config = ConnectionConfig::default().with_lazy_connect(true);
        let conn = open(config, Arc::clone(&connector)).await;
        tokio::task::yield_now().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let ping = conn.submit(&cmd("PING")).unwrap();
        let mut server = servers.pop_front().unwrap();
        assert_eq!(server.command().await, ["PING"]);
        server.reply(b"+PONG\r\n").await;
        assert_eq!(ping.await.unwrap(), RespValue::SimpleString("PONG".into()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handshake_sequence() {
        let (connector, mut servers) = setup(1);
        let mut server = servers.pop_front().unwrap();
        let server_task = tokio::spawn(async move {
            assert_eq!(server.command().await, ["AUTH", "app", "secret"]);
            server.reply(b"+OK\r\n").await;
            assert_eq!(server.command().await, ["SELECT", "2"]);
            server.reply(b"+OK\r\n").await;
            assert_eq!(server.command().await, ["CLIENT", "SETNAME", "worker"]);
            server.reply(b"+OK\r\n").await;
            server
        });

        let config = ConnectionConfig::default()
            .with_credentials("app", "secret")
            .with_database(2)
            .with_client_name("worker");
        let conn = open(config, connector).await;
        let _server = server_task.await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(
            conn.negotiation().map(|n| n.version),
            Some(ProtocolVersion::Resp2)
        );
    }

    #[tokio::test]
    async fn test_wrong_password_fails_connect() {
        let (connector, mut servers) = setup(1);
        let mut server = servers.pop_front().unwrap();
        tokio::spawn(async move {
            server.command().await;
            server
                .reply(b"-WRONGPASS invalid username-password pair\r\n")
                .await;
            server
        });
        let config = ConnectionConfig::default()
            .with_password("nope")
            .with_reconnect(SharedRetryPolicy::new(NoRetry));
        let result =
            Connection::connect_with_connector(endpoint(), config, connector).await;
        assert!(matches!(result, Err(RedisError::Auth(_))));
    }

    #[tokio::test]
    async fn test_resend_unfulfilled_after_drop() {
        let (connector, mut servers) = setup(2);
        let config = ConnectionConfig::default()
            .with_resend_unfulfilled(true)
            .with_reconnect(quick_retry(3));
        let conn = open(config, connector).await;

        let get = conn.submit(&cmd("GET").arg("k")).unwrap();
        let mut first = servers.pop_front().unwrap();
        first.command().await;
        drop(first);

        let mut second = servers.pop_front().unwrap();
        assert_eq!(second.command().await, ["GET", "k"]);
        second.reply(b"$1\r\nv\r\n").await;
        assert_eq!(get.await.unwrap(), RespValue::BulkString(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_subscriber_mode_and_resubscribe() {
        let (connector, mut servers) = setup(2);
        let config = ConnectionConfig::default().with_reconnect(quick_retry(3));
        let conn = open(config, connector).await;
        let mut subscriber = Subscriber::new(conn.clone());
        let mut first = servers.pop_front().unwrap();

        let (result, ()) = tokio::join!(subscriber.subscribe(vec!["news".into()]), async {
            assert_eq!(first.command().await, ["SUBSCRIBE", "news"]);
            first
                .reply(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
                .await;
        });
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Subscribed);
        assert!(subscriber.is_subscribed_to_channel("news"));
        assert!(matches!(
            conn.submit(&cmd("GET").arg("k")),
            Err(RedisError::Connection(_))
        ));

        first
            .reply(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n")
            .await;
        let message = subscriber.next_message().await.unwrap().unwrap();
        assert_eq!(message.payload_str(), "hello");

        drop(first);
        let mut second = servers.pop_front().unwrap();
        assert_eq!(second.command().await, ["SUBSCRIBE", "news"]);
        second
            .reply(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nagain\r\n")
            .await;
        let message = subscriber.next_message().await.unwrap().unwrap();
        assert_eq!(message.payload_str(), "again");
        assert_eq!(conn.state(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn test_unsubscribe_returns_to_ready() {
        let (connector, mut servers) = setup(1);
        let conn = open(ConnectionConfig::default(), connector).await;
        let mut subscriber = Subscriber::new(conn.clone());
        let mut server = servers.pop_front().unwrap();

        let (result, ()) = tokio::join!(subscriber.psubscribe(vec!["n*".into()]), async {
            server.command().await;
            server
                .reply(b"*3\r\n$10\r\npsubscribe\r\n$2\r\nn*\r\n:1\r\n")
                .await;
        });
        result.unwrap();

        let (result, ()) = tokio::join!(subscriber.punsubscribe(vec![]), async {
            assert_eq!(server.command().await, ["PUNSUBSCRIBE"]);
            server
                .reply(b"*3\r\n$12\r\npunsubscribe\r\n$2\r\nn*\r\n:0\r\n")
                .await;
        });
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(subscriber.subscribed_patterns().is_empty());
    }

    #[tokio::test]
    async fn test_quit_flushes_then_closes() {
        let (connector, mut servers) = setup(1);
        let conn = open(ConnectionConfig::default(), connector).await;
        let mut server = servers.pop_front().unwrap();

        let get = conn.submit(&cmd("GET").arg("k")).unwrap();
        let (_, ()) = tokio::join!(conn.quit(), async {
            assert_eq!(server.command().await, ["GET", "k"]);
            assert_eq!(server.command().await, ["QUIT"]);
            server.reply(b"$-1\r\n+OK\r\n").await;
        });
        assert_eq!(get.await.unwrap(), RespValue::Null);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.submit(&cmd("PING")),
            Err(RedisError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_retarget_reconnects_to_new_endpoint() {
        let (connector, mut servers) = setup(2);
        let conn = open(ConnectionConfig::default(), Arc::clone(&connector)).await;
        let _first = servers.pop_front().unwrap();
        let mut events = conn.events();

        let target = Endpoint::tcp("10.0.0.2", 6380);
        conn.retarget(target.clone());
        loop {
            if let ConnectionEvent::Connected { endpoint } = events.recv().await.unwrap() {
                assert_eq!(endpoint, target);
                break;
            }
        }
        assert_eq!(conn.endpoint(), target);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        let ping = conn.submit(&cmd("PING")).unwrap();
        let mut second = servers.pop_front().unwrap();
        second.command().await;
        second.reply(b"+PONG\r\n").await;
        assert_eq!(ping.await.unwrap(), RespValue::SimpleString("PONG".into()));
    }
}
