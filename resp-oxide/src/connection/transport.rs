//! Byte-stream transports and the handshake channel that runs on them

use crate::protocol::{ProtocolConnection, RespDecoder, RespEncoder};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use resp_oxide_core::{
    config::{ConnectionConfig, Endpoint, ProtocolVersion},
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub(crate) const READ_BUFFER_CAPACITY: usize = 8192;

/// A bidirectional byte stream a connection can run on
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport
pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to endpoints
///
/// The default [`TcpConnector`] covers TCP and Unix sockets; TLS or test
/// transports plug in here.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a fresh transport to `endpoint`
    async fn connect(
        &self,
        endpoint: &Endpoint,
        config: &ConnectionConfig,
    ) -> RedisResult<BoxedTransport>;
}

/// Shared connector handle
pub type SharedConnector = Arc<dyn Connector>;

/// Plain TCP (with keepalive and no-delay) or Unix-socket connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        config: &ConnectionConfig,
    ) -> RedisResult<BoxedTransport> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                debug!("Connecting to {}", endpoint);
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        RedisError::Connection(format!("Failed to connect to {endpoint}: {e}"))
                    })?;
                stream.set_nodelay(true)?;

                if let Some(keepalive_duration) = config.tcp_keepalive {
                    let socket = socket2::SockRef::from(&stream);
                    let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
                    socket.set_tcp_keepalive(&keepalive).map_err(|e| {
                        RedisError::Connection(format!("Failed to set TCP keepalive: {e}"))
                    })?;
                }
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                debug!("Connecting to unix socket {}", path.display());
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                    RedisError::Connection(format!("Failed to connect to {endpoint}: {e}"))
                })?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(RedisError::Config(
                "Unix sockets are not supported on this platform".to_string(),
            )),
        }
    }
}

/// Sequential request/reply access to a fresh transport, used by the handshake
pub(crate) struct HandshakeIo {
    stream: BoxedTransport,
    decoder: RespDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl HandshakeIo {
    pub(crate) fn new(stream: BoxedTransport) -> Self {
        Self {
            stream,
            decoder: RespDecoder::new(ProtocolVersion::Resp2),
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buf: BytesMut::new(),
        }
    }

    /// Read the next frame of any kind
    pub(crate) async fn read_frame(&mut self) -> RedisResult<RespValue> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(RedisError::Connection(
                    "Connection closed by server".to_string(),
                ));
            }
        }
    }

    /// Write several command frames in one go
    pub(crate) async fn write_raw(&mut self, frames: &[u8]) -> RedisResult<()> {
        self.stream.write_all(frames).await?;
        Ok(())
    }

    /// Hand the stream and any bytes read past the handshake to the driver
    pub(crate) fn into_parts(self) -> (BoxedTransport, RespDecoder, BytesMut) {
        (self.stream, self.decoder, self.read_buf)
    }
}

#[async_trait]
impl ProtocolConnection for HandshakeIo {
    async fn send_command(&mut self, name: &str, args: &[Bytes]) -> RedisResult<()> {
        self.write_buf.clear();
        RespEncoder::encode_command(name.as_bytes(), args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    async fn read_response(&mut self) -> RedisResult<RespValue> {
        loop {
            match self.read_frame().await? {
                RespValue::Push(items) => trace!("Skipping push during handshake: {:?}", items),
                frame => return Ok(frame),
            }
        }
    }

    fn set_protocol(&mut self, version: ProtocolVersion) {
        self.decoder.set_version(version);
    }
}
