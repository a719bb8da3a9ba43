//! Transactions with MULTI/EXEC
//!
//! A transaction is a pipeline wrapped in MULTI and EXEC, written in one
//! go. If the server rejects any command while queueing, EXEC fails and the
//! whole batch reports [`RedisError::TransactionAborted`] instead of a partial
//! result list.
//!
//! WATCH is not offered: on a shared, pipelined connection another caller's
//! commands can land between WATCH and MULTI, so the optimistic lock would
//! not protect what callers expect.
//!
//! # Examples
//!
//! ```no_run
//! use resp_oxide::{Client, ConnectionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new("redis://localhost:6379");
//! let client = Client::connect(config).await?;
//!
//! let mut transaction = client.transaction();
//! transaction.set("key1", "value1");
//! transaction.incr("counter");
//!
//! let results = transaction.exec().await?;
//! println!("Transaction results: {:?}", results);
//! # Ok(())
//! # }
//! ```

use crate::command::Cmd;
use crate::pipeline::{PipelineExecutor, PipelineResult};
use resp_oxide_core::{error::RedisResult, types::RedisValue};
use std::sync::Arc;

/// A batch of commands executed atomically
pub struct Transaction {
    commands: Vec<Cmd>,
    executor: Arc<dyn PipelineExecutor>,
}

impl Transaction {
    /// Create a new transaction on `executor`
    pub fn new(executor: Arc<dyn PipelineExecutor>) -> Self {
        Self {
            commands: Vec::new(),
            executor,
        }
    }

    /// Add a command to the transaction
    pub fn add_command(&mut self, command: Cmd) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Add a SET command
    pub fn set(&mut self, key: impl Into<RedisValue>, value: impl Into<RedisValue>) -> &mut Self {
        self.add_command(Cmd::new("SET").arg(key).arg(value))
    }

    /// Add a GET command
    pub fn get(&mut self, key: impl Into<RedisValue>) -> &mut Self {
        self.add_command(Cmd::new("GET").arg(key))
    }

    /// Add a DEL command
    pub fn del(&mut self, keys: Vec<String>) -> &mut Self {
        self.add_command(Cmd::new("DEL").args(keys))
    }

    /// Add an INCR command
    pub fn incr(&mut self, key: impl Into<RedisValue>) -> &mut Self {
        self.add_command(Cmd::new("INCR").arg(key))
    }

    /// Get the number of queued commands
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if no commands are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop the queued commands without sending anything
    pub fn discard(&mut self) {
        self.commands.clear();
    }

    /// Send MULTI, the queued commands and EXEC in one write
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::TransactionAborted`](resp_oxide_core::RedisError::TransactionAborted)
    /// if the server refused the batch, or a connection error.
    pub async fn exec(&mut self) -> RedisResult<PipelineResult> {
        let commands = std::mem::take(&mut self.commands);
        let results = self.executor.execute_transaction(&commands).await?;
        Ok(PipelineResult::new(results))
    }
}
