//! Wire protocol: request encoding, incremental reply decoding and the
//! once-per-connection RESP2/RESP3 negotiation.

pub mod decoder;
pub mod encoder;

pub use decoder::RespDecoder;
pub use encoder::RespEncoder;
pub use resp_oxide_core::config::ProtocolVersion;

use bytes::Bytes;
use resp_oxide_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use tracing::{debug, warn};

/// Outcome of the handshake's protocol step
#[derive(Debug, Clone, Default)]
pub struct ProtocolNegotiation {
    /// The negotiated protocol version
    pub version: ProtocolVersion,
    /// `server` field of the HELLO reply
    pub server: Option<String>,
    /// `version` field of the HELLO reply
    pub server_version: Option<String>,
    /// Connection id assigned by the server
    pub id: Option<i64>,
    /// `standalone`, `sentinel` or `cluster`
    pub mode: Option<String>,
    /// `master` or `replica`
    pub role: Option<String>,
    /// Loaded module names
    pub modules: Vec<String>,
    /// AUTH was carried out (inside HELLO or separately)
    pub authenticated: bool,
    /// SETNAME was carried inside HELLO
    pub client_name_set: bool,
}

impl ProtocolNegotiation {
    /// Create a new protocol negotiation result
    #[must_use]
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Build from the map (RESP3) or flat array (RESP2 framing) a HELLO reply carries
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is not a map-like aggregate.
    pub fn from_hello(reply: RespValue) -> RedisResult<Self> {
        let mut negotiation = Self::new(ProtocolVersion::Resp3);
        for (key, value) in reply.into_pairs()? {
            let Ok(key) = key.as_string() else { continue };
            match key.as_str() {
                "server" => negotiation.server = value.as_string().ok(),
                "version" => negotiation.server_version = value.as_string().ok(),
                "id" => negotiation.id = value.as_int().ok(),
                "mode" => negotiation.mode = value.as_string().ok(),
                "role" => negotiation.role = value.as_string().ok(),
                "proto" => {
                    if value.as_int().ok() == Some(2) {
                        negotiation.version = ProtocolVersion::Resp2;
                    }
                }
                "modules" => {
                    negotiation.modules = value
                        .as_array()
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|module| module.into_pairs().ok())
                        .filter_map(|pairs| {
                            pairs
                                .into_iter()
                                .find(|(k, _)| k.eq_str("name"))
                                .and_then(|(_, name)| name.as_string().ok())
                        })
                        .collect();
                }
                _ => {}
            }
        }
        Ok(negotiation)
    }

    /// Whether the server reported cluster mode
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        self.mode.as_deref() == Some("cluster")
    }

    /// Check if a module is loaded
    #[must_use]
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }
}

/// A request/reply channel usable before the connection driver takes over
#[async_trait::async_trait]
pub trait ProtocolConnection: Send {
    /// Send one command to the server
    async fn send_command(&mut self, name: &str, args: &[Bytes]) -> RedisResult<()>;

    /// Read the next non-push reply from the server
    async fn read_response(&mut self) -> RedisResult<RespValue>;

    /// Switch the tag set the reply decoder accepts
    fn set_protocol(&mut self, version: ProtocolVersion);

    /// Send one command and read its reply
    async fn request(&mut self, name: &str, args: &[Bytes]) -> RedisResult<RespValue> {
        self.send_command(name, args).await?;
        self.read_response().await
    }
}

/// Credentials and name carried by the protocol step of the handshake
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloOptions<'a> {
    /// ACL username
    pub username: Option<&'a str>,
    /// Password
    pub password: Option<&'a str>,
    /// Client name
    pub client_name: Option<&'a str>,
}

/// Protocol negotiator for handling RESP2/RESP3 protocol selection
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolNegotiator {
    preferred_version: ProtocolVersion,
}

impl ProtocolNegotiator {
    /// Create a new protocol negotiator
    #[must_use]
    pub const fn new(preferred_version: ProtocolVersion) -> Self {
        Self { preferred_version }
    }

    /// Negotiate the protocol and authenticate
    ///
    /// With RESP3 preferred, `HELLO 3` carries AUTH and SETNAME in one round
    /// trip. A server that refuses HELLO leaves the connection on RESP2 and
    /// AUTH is sent on its own.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Auth`] if the credentials are rejected, or a
    /// transport error.
    pub async fn negotiate<T>(
        &self,
        connection: &mut T,
        options: HelloOptions<'_>,
    ) -> RedisResult<ProtocolNegotiation>
    where
        T: ProtocolConnection,
    {
        if self.preferred_version == ProtocolVersion::Resp3 {
            match Self::try_negotiate_resp3(connection, options).await {
                Ok(negotiation) => return Ok(negotiation),
                Err(RedisError::Server(msg)) if !is_auth_failure(&msg) => {
                    warn!("HELLO 3 rejected ({}), falling back to RESP2", msg);
                    connection.set_protocol(ProtocolVersion::Resp2);
                }
                Err(RedisError::Server(msg)) => return Err(RedisError::Auth(msg)),
                Err(e) => return Err(e),
            }
        }

        let mut negotiation = ProtocolNegotiation::new(ProtocolVersion::Resp2);
        if let Some(password) = options.password {
            let mut args = Vec::with_capacity(2);
            if let Some(username) = options.username {
                args.push(Bytes::copy_from_slice(username.as_bytes()));
            }
            args.push(Bytes::copy_from_slice(password.as_bytes()));
            match connection.request("AUTH", &args).await? {
                RespValue::Error(msg) => return Err(RedisError::Auth(msg)),
                _ => negotiation.authenticated = true,
            }
        }
        Ok(negotiation)
    }

    async fn try_negotiate_resp3<T>(
        connection: &mut T,
        options: HelloOptions<'_>,
    ) -> RedisResult<ProtocolNegotiation>
    where
        T: ProtocolConnection,
    {
        let mut args = vec![Bytes::from_static(b"3")];
        if let Some(password) = options.password {
            args.push(Bytes::from_static(b"AUTH"));
            args.push(Bytes::copy_from_slice(
                options.username.unwrap_or("default").as_bytes(),
            ));
            args.push(Bytes::copy_from_slice(password.as_bytes()));
        }
        if let Some(name) = options.client_name {
            args.push(Bytes::from_static(b"SETNAME"));
            args.push(Bytes::copy_from_slice(name.as_bytes()));
        }

        // The reply to HELLO 3 is already a RESP3 map
        connection.set_protocol(ProtocolVersion::Resp3);
        let reply = connection.request("HELLO", &args).await?.into_result()?;
        let mut negotiation = ProtocolNegotiation::from_hello(reply)?;
        negotiation.authenticated = options.password.is_some();
        negotiation.client_name_set = options.client_name.is_some();
        connection.set_protocol(negotiation.version);
        debug!(
            "Negotiated {} with {} {}",
            negotiation.version,
            negotiation.server.as_deref().unwrap_or("server"),
            negotiation.server_version.as_deref().unwrap_or("")
        );
        Ok(negotiation)
    }
}

fn is_auth_failure(msg: &str) -> bool {
    msg.starts_with("WRONGPASS") || msg.starts_with("NOAUTH") || msg.contains("invalid password")
}
