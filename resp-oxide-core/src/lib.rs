//! Core types for the resp-oxide client engine
//!
//! This crate provides the reply frame, argument, error, configuration and
//! retry-policy types shared by the protocol, connection and cluster layers.

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod retry;
pub mod types;
pub mod value;

pub use config::{
    AutoPipelineConfig, ClusterConfig, ConnectionConfig, Endpoint, ProtocolVersion, ReadPolicy,
    TopologyMode,
};
pub use error::{RedisError, RedisResult};
pub use retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryPolicy, SharedRetryPolicy};
pub use types::{NodeInfo, RedisValue, SlotRange};
pub use value::RespValue;
