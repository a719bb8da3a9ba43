//! Pipelined RESP client engine for Rust
//!
//! `resp-oxide` speaks RESP2 and RESP3 over a single multiplexed connection
//! per server. Callers on many tasks share that connection: commands are
//! queued while it is offline, coalesced into one write when auto-pipelining
//! is on, and answered strictly in submission order. Against a cluster, the
//! router hashes keys to slots and follows MOVED and ASK redirects.
//!
//! # Features
//!
//! - RESP2/RESP3 codec with HELLO negotiation and RESP2 fallback
//! - Offline queue, reconnect with a pluggable retry policy, lazy connect
//! - Automatic topology detection (standalone or cluster)
//! - Coalesced topology refresh and read/write splitting over replicas
//! - Pipelines, MULTI/EXEC transactions, Lua scripts with EVALSHA fallback
//! - Pub/Sub with resubscribe after reconnect
//! - Failover following through Redis Sentinel
//!
//! # Quick Start
//!
//! ```no_run
//! use resp_oxide::{cmd, Client, ConnectionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("redis://localhost:6379");
//!     let client = Client::connect(config).await?;
//!
//!     client.set("mykey", "myvalue").await?;
//!     let value = client.send(&cmd("GET").arg("mykey")).await?;
//!     println!("Value: {:?}", value);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::return_self_not_must_use)]

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod discovery;
pub mod pipeline;
pub mod protocol;
pub mod pubsub;
pub mod script;
pub mod transaction;

pub use client::Client;
pub use cluster::{key_slot, ClusterRouter, SlotMap};
pub use command::{cmd, Cmd, KeySpec};
pub use connection::{
    Connection, ConnectionEvent, ConnectionState, Connector, ReplyFuture, TcpConnector,
};
pub use discovery::{Discovery, SentinelConfig, SentinelDiscovery, StaticDiscovery};
pub use pipeline::{Pipeline, PipelineResult};
pub use protocol::ProtocolNegotiation;
pub use pubsub::{PubSubMessage, Subscriber, SubscriptionKind};
pub use script::Script;
pub use transaction::Transaction;

pub use resp_oxide_core::{
    config::{
        AutoPipelineConfig, ClusterConfig, ConnectionConfig, Endpoint, ProtocolVersion,
        ReadPolicy, TopologyMode,
    },
    error::{RedisError, RedisResult},
    retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryPolicy, SharedRetryPolicy},
    types::{NodeInfo, RedisValue, SlotRange},
    value::RespValue,
};
