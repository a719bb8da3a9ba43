//! Common types used throughout the library

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A command argument before it is turned into wire bytes
///
/// Arrays are flattened into consecutive arguments and `Nil` becomes an
/// empty string, so any of these can be handed to a command builder.
#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    /// Encoded as an empty argument
    Nil,
    /// String value
    String(String),
    /// Binary data
    Bytes(Bytes),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Flattened into one argument per element
    Array(Vec<RedisValue>),
}

impl RedisValue {
    /// Append this value's wire arguments to `out`
    pub fn write_args(self, out: &mut Vec<Bytes>) {
        match self {
            Self::Nil => out.push(Bytes::new()),
            Self::String(s) => out.push(Bytes::from(s.into_bytes())),
            Self::Bytes(b) => out.push(b),
            Self::Int(i) => out.push(Bytes::from(i.to_string().into_bytes())),
            Self::Float(f) => out.push(Bytes::from(f.to_string().into_bytes())),
            Self::Array(items) => {
                for item in items {
                    item.write_args(out);
                }
            }
        }
    }
}

impl From<String> for RedisValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&String> for RedisValue {
    fn from(s: &String) -> Self {
        Self::String(s.clone())
    }
}

impl From<&str> for RedisValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<Vec<u8>> for RedisValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for RedisValue {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for RedisValue {
    fn from(b: &[u8; N]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for RedisValue {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<i64> for RedisValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for RedisValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u16> for RedisValue {
    fn from(i: u16) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for RedisValue {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u64> for RedisValue {
    fn from(i: u64) -> Self {
        // u64 beyond i64::MAX still has to reach the wire verbatim
        i64::try_from(i).map_or_else(|_| Self::String(i.to_string()), Self::Int)
    }
}

impl From<usize> for RedisValue {
    fn from(i: usize) -> Self {
        Self::from(i as u64)
    }
}

impl From<f64> for RedisValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl<T: Into<RedisValue>> From<Option<T>> for RedisValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

impl<T: Into<RedisValue>> From<Vec<T>> for RedisValue {
    fn from(arr: Vec<T>) -> Self {
        Self::Array(arr.into_iter().map(Into::into).collect())
    }
}

/// Represents a slot range in a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if a slot is within this range
    #[must_use]
    pub const fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Number of slots covered
    #[must_use]
    pub const fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Ranges are never empty; present for API symmetry with `len`
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Node information in a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node ID (empty when the server did not report one)
    pub id: String,
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Slot ranges this node serves (as primary or replica)
    pub slots: Vec<SlotRange>,
    /// Whether this is a primary node
    pub is_master: bool,
}

impl NodeInfo {
    /// Create a new node info
    #[must_use]
    pub const fn new(id: String, host: String, port: u16) -> Self {
        Self {
            id,
            host,
            port,
            slots: Vec::new(),
            is_master: true,
        }
    }

    /// `host:port` key used to index node connections
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Check if this node owns a given slot
    #[must_use]
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|range| range.contains(slot))
    }
}
