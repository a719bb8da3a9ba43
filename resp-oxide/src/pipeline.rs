//! Pipeline support for batching commands
//!
//! A pipeline accumulates commands without sending them. On `execute` they
//! are written as one contiguous run of frames and the replies come back as
//! one ordered list, each entry its own success or failure: one rejected
//! command never hides the results of the others.
//!
//! # Examples
//!
//! ```no_run
//! use resp_oxide::{cmd, Client, ConnectionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new("redis://localhost:6379");
//! let client = Client::connect(config).await?;
//!
//! let mut pipeline = client.pipeline();
//! pipeline.set("key1", "value1");
//! pipeline.get("key1");
//! pipeline.add_command(cmd("INCR").arg("counter"));
//!
//! let mut results = pipeline.execute().await?;
//! let value: String = results.next()?;
//! # Ok(())
//! # }
//! ```

use crate::command::Cmd;
use crate::connection::Connection;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use resp_oxide_core::{
    error::{RedisError, RedisResult},
    types::RedisValue,
    value::RespValue,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Something that can run a batch of commands in one round trip
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Write `commands` as one batch; one result per command, in order
    async fn execute_pipeline(&self, commands: &[Cmd])
        -> RedisResult<Vec<RedisResult<RespValue>>>;

    /// Run `commands` inside MULTI/EXEC
    ///
    /// A command rejected while queueing aborts the whole batch with
    /// [`RedisError::TransactionAborted`].
    async fn execute_transaction(
        &self,
        commands: &[Cmd],
    ) -> RedisResult<Vec<RedisResult<RespValue>>>;
}

/// A batch of commands sent in one write
pub struct Pipeline {
    commands: Vec<Cmd>,
    executor: Arc<dyn PipelineExecutor>,
}

impl Pipeline {
    /// Create a new pipeline on `executor`
    pub fn new(executor: Arc<dyn PipelineExecutor>) -> Self {
        Self {
            commands: Vec::new(),
            executor,
        }
    }

    /// Add a command to the pipeline
    pub fn add_command(&mut self, command: Cmd) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Add a SET command to the pipeline
    pub fn set(&mut self, key: impl Into<RedisValue>, value: impl Into<RedisValue>) -> &mut Self {
        self.add_command(Cmd::new("SET").arg(key).arg(value))
    }

    /// Add a GET command to the pipeline
    pub fn get(&mut self, key: impl Into<RedisValue>) -> &mut Self {
        self.add_command(Cmd::new("GET").arg(key))
    }

    /// Add a DEL command to the pipeline
    pub fn del(&mut self, keys: Vec<String>) -> &mut Self {
        self.add_command(Cmd::new("DEL").args(keys))
    }

    /// Add an INCR command to the pipeline
    pub fn incr(&mut self, key: impl Into<RedisValue>) -> &mut Self {
        self.add_command(Cmd::new("INCR").arg(key))
    }

    /// Add an INCRBY command to the pipeline
    pub fn incr_by(&mut self, key: impl Into<RedisValue>, increment: i64) -> &mut Self {
        self.add_command(Cmd::new("INCRBY").arg(key).arg(increment))
    }

    /// Add an EXPIRE command to the pipeline
    pub fn expire(&mut self, key: impl Into<RedisValue>, seconds: std::time::Duration) -> &mut Self {
        self.add_command(Cmd::new("EXPIRE").arg(key).arg(seconds.as_secs()))
    }

    /// Get the number of commands in the pipeline
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if the pipeline is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Clear all commands from the pipeline
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Execute all commands, consuming them
    ///
    /// # Errors
    ///
    /// Returns an error only if the batch as a whole could not be delivered;
    /// per-command server errors are inside the returned [`PipelineResult`].
    pub async fn execute(&mut self) -> RedisResult<PipelineResult> {
        if self.commands.is_empty() {
            return Ok(PipelineResult::new(Vec::new()));
        }
        let commands = std::mem::take(&mut self.commands);
        let results = self.executor.execute_pipeline(&commands).await?;
        Ok(PipelineResult::new(results))
    }
}

/// Per-command results of a pipeline or transaction
#[derive(Debug)]
pub struct PipelineResult {
    results: VecDeque<RedisResult<RespValue>>,
}

impl PipelineResult {
    /// Create a new pipeline result
    #[must_use]
    pub fn new(results: Vec<RedisResult<RespValue>>) -> Self {
        Self {
            results: results.into(),
        }
    }

    /// Take the next result, converting it
    ///
    /// # Errors
    ///
    /// Returns the command's own error, an error if there are no more
    /// results, or a conversion error.
    pub fn next<T>(&mut self) -> RedisResult<T>
    where
        T: TryFrom<RespValue>,
        T::Error: Into<RedisError>,
    {
        let result = self
            .results
            .pop_front()
            .ok_or_else(|| RedisError::Protocol("No more results in pipeline".to_string()))?;
        T::try_from(result?).map_err(Into::into)
    }

    /// Peek at a result not yet taken
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&RedisResult<RespValue>> {
        self.results.get(index)
    }

    /// Get the number of results
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if there are no results
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Get all remaining results
    #[must_use]
    pub fn into_results(self) -> Vec<RedisResult<RespValue>> {
        self.results.into()
    }
}

pub(crate) fn encode_batch(commands: &[Cmd]) -> Bytes {
    let mut buf = BytesMut::new();
    for command in commands {
        command.write_frame(&mut buf);
    }
    buf.freeze()
}

pub(crate) fn encode_transaction(commands: &[Cmd]) -> Bytes {
    let mut buf = BytesMut::new();
    Cmd::new("MULTI").write_frame(&mut buf);
    for command in commands {
        command.write_frame(&mut buf);
    }
    Cmd::new("EXEC").write_frame(&mut buf);
    buf.freeze()
}

/// Name used in errors for a whole batch
pub(crate) fn batch_name(commands: &[Cmd]) -> String {
    match commands {
        [only] => only.name().to_string(),
        _ => format!("PIPELINE({})", commands.len()),
    }
}

/// Split the grouped reply of a batch into per-command results
pub(crate) fn split_replies(
    reply: RespValue,
    count: usize,
) -> RedisResult<Vec<RedisResult<RespValue>>> {
    let RespValue::Array(frames) = reply else {
        return Err(RedisError::UnexpectedResponse(format!(
            "expected {count} pipeline replies, got {}",
            reply.kind()
        )));
    };
    if frames.len() != count {
        return Err(RedisError::Protocol(format!(
            "expected {count} pipeline replies, got {}",
            frames.len()
        )));
    }
    Ok(frames.into_iter().map(RespValue::into_result).collect())
}

/// Interpret MULTI, the queue acknowledgements and EXEC
pub(crate) fn transaction_outcome(
    reply: RespValue,
    count: usize,
) -> RedisResult<Vec<RedisResult<RespValue>>> {
    let mut frames = split_replies(reply, count + 2)?.into_iter();
    if let Some(Err(err)) = frames.next() {
        return Err(RedisError::TransactionAborted(format!("MULTI rejected: {err}")));
    }

    let mut rejected = None;
    let mut exec = None;
    for (index, frame) in frames.enumerate() {
        if index == count {
            exec = Some(frame);
        } else if let Err(err) = frame {
            rejected.get_or_insert((index, err));
        }
    }

    if let Some((index, cause)) = rejected {
        let exec = match exec {
            Some(Err(err)) => format!("{err}; "),
            _ => String::new(),
        };
        return Err(RedisError::TransactionAborted(format!(
            "{exec}command {index} was rejected: {cause}"
        )));
    }

    match exec {
        Some(Ok(RespValue::Array(items))) if items.len() == count => {
            Ok(items.into_iter().map(RespValue::into_result).collect())
        }
        Some(Ok(RespValue::Array(items))) => Err(RedisError::Protocol(format!(
            "EXEC returned {} results for {count} commands",
            items.len()
        ))),
        Some(Ok(RespValue::Null)) => Err(RedisError::TransactionAborted(
            "EXEC returned null; the transaction was discarded".to_string(),
        )),
        Some(Err(err)) => Err(RedisError::TransactionAborted(err.to_string())),
        Some(Ok(other)) => Err(RedisError::UnexpectedResponse(format!(
            "EXEC returned {}",
            other.kind()
        ))),
        None => Err(RedisError::Protocol("missing EXEC reply".to_string())),
    }
}

#[async_trait]
impl PipelineExecutor for Connection {
    async fn execute_pipeline(
        &self,
        commands: &[Cmd],
    ) -> RedisResult<Vec<RedisResult<RespValue>>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .submit_group(encode_batch(commands), commands.len(), batch_name(commands))?
            .await?;
        split_replies(reply, commands.len())
    }

    async fn execute_transaction(
        &self,
        commands: &[Cmd],
    ) -> RedisResult<Vec<RedisResult<RespValue>>> {
        let reply = self
            .submit_group(
                encode_transaction(commands),
                commands.len() + 2,
                "MULTI".to_string(),
            )?
            .await?;
        transaction_outcome(reply, commands.len())
    }
}
