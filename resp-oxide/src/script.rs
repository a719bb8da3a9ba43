//! Lua scripts sent as custom commands
//!
//! A [`Script`] is sent with `EVALSHA` first. If the server has not cached
//! it yet (`NOSCRIPT`), the same call is repeated with `EVAL`, which also
//! caches it for next time.
//!
//! # Examples
//!
//! ```no_run
//! use resp_oxide::{Client, ConnectionConfig, Script};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect(ConnectionConfig::new("redis://localhost:6379")).await?;
//!
//! let script = Script::new("return redis.call('INCRBY', KEYS[1], ARGV[1])");
//! let value: i64 = script
//!     .invoke_as(&client, vec!["counter".to_string()], vec!["5".to_string()])
//!     .await?;
//! println!("counter = {value}");
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::command::Cmd;
use resp_oxide_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use sha1::{Digest, Sha1};
use tracing::debug;

/// A Lua script and its SHA1 digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    source: String,
    sha: String,
}

impl Script {
    /// Create a script, hashing its source for `EVALSHA`
    ///
    /// ```
    /// use resp_oxide::Script;
    ///
    /// let script = Script::new("return 1");
    /// assert_eq!(script.sha().len(), 40);
    /// ```
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let sha = calculate_sha1(&source);
        Self { source, sha }
    }

    /// Hex SHA1 of the source
    #[must_use]
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// Lua source
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The `EVALSHA` command for these keys and arguments
    #[must_use]
    pub fn evalsha_command(&self, keys: &[String], args: &[String]) -> Cmd {
        Self::command("EVALSHA", &self.sha, keys, args)
    }

    /// The `EVAL` command for these keys and arguments
    #[must_use]
    pub fn eval_command(&self, keys: &[String], args: &[String]) -> Cmd {
        Self::command("EVAL", &self.source, keys, args)
    }

    fn command(name: &str, body: &str, keys: &[String], args: &[String]) -> Cmd {
        Cmd::new(name)
            .arg(body)
            .arg(keys.len())
            .args(keys.iter().map(String::as_str))
            .args(args.iter().map(String::as_str))
    }

    /// Run the script, loading it with `EVAL` if the server lacks it
    ///
    /// # Errors
    ///
    /// Returns the script's error reply or a transport error.
    pub async fn invoke(
        &self,
        client: &Client,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> RedisResult<RespValue> {
        match client.send(&self.evalsha_command(&keys, &args)).await {
            Err(err) if err.is_noscript() => {
                debug!("Script {} not cached, falling back to EVAL", self.sha);
                client.send(&self.eval_command(&keys, &args)).await
            }
            other => other,
        }
    }

    /// Run the script and convert its reply
    ///
    /// # Errors
    ///
    /// Returns the script's error reply, a transport error or a conversion error.
    pub async fn invoke_as<T>(
        &self,
        client: &Client,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> RedisResult<T>
    where
        T: TryFrom<RespValue>,
        T::Error: Into<RedisError>,
    {
        self.invoke(client, keys, args)
            .await
            .and_then(|value| T::try_from(value).map_err(Into::into))
    }

    /// Cache the script on the server with `SCRIPT LOAD`, returning its SHA1
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the script.
    pub async fn load(&self, client: &Client) -> RedisResult<String> {
        client
            .send(&Cmd::new("SCRIPT").arg("LOAD").arg(self.source.as_str()))
            .await?
            .as_string()
    }
}

fn calculate_sha1(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
