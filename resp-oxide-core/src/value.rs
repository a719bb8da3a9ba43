//! RESP (`REdis` Serialization Protocol) reply frames
//!
//! One enum covers the RESP2 tag set and the RESP3 extensions. Aggregates
//! keep wire order; maps are pair lists rather than hash maps so that keys of
//! any frame type survive decoding.

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// A decoded reply frame
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n (also RESP3 blob errors)
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// RESP3 double: ,1.23\r\n
    Double(f64),
    /// RESP3 boolean: #t\r\n
    Boolean(bool),
    /// Null bulk string, null array or RESP3 null
    Null,
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// RESP3 verbatim string: =15\r\ntxt:Some string\r\n
    Verbatim {
        /// Three-byte format marker such as `txt` or `mkd`
        format: String,
        /// Payload after the format prefix
        data: Bytes,
    },
    /// RESP3 big number, or an integer reply that does not fit in i64
    BigNumber(String),
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
    /// RESP3 map in wire order
    Map(Vec<(RespValue, RespValue)>),
    /// RESP3 set in wire order
    Set(Vec<RespValue>),
    /// RESP3 out-of-band push message
    Push(Vec<RespValue>),
}

impl RespValue {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) | Self::BigNumber(s) => Ok(s.clone()),
            Self::BulkString(b) | Self::Verbatim { data: b, .. } => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}"))),
            Self::Integer(i) => Ok(i.to_string()),
            Self::Double(d) => Ok(d.to_string()),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Boolean(b) => Ok(i64::from(*b)),
            Self::BulkString(_) | Self::SimpleString(_) => {
                let s = self.as_string()?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to a float if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a float.
    pub fn as_f64(&self) -> RedisResult<f64> {
        match self {
            Self::Double(d) => Ok(*d),
            Self::Integer(i) => Ok(*i as f64),
            Self::BulkString(_) | Self::SimpleString(_) | Self::BigNumber(_) => {
                let s = self.as_string()?;
                s.parse::<f64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse float: {e}")))
            }
            _ => Err(RedisError::Type(format!("Cannot convert {self:?} to float"))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) | Self::Verbatim { data: b, .. } => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.as_bytes().to_vec())),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Convert to an array if possible; sets and pushes count as arrays
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an array.
    pub fn as_array(&self) -> RedisResult<Vec<Self>> {
        match self {
            Self::Array(arr) | Self::Set(arr) | Self::Push(arr) => Ok(arr.clone()),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to array"
            ))),
        }
    }

    /// Convert into key/value pairs; RESP2 flat arrays are paired up
    ///
    /// # Errors
    ///
    /// Returns an error for non-aggregate values or odd-length arrays.
    pub fn into_pairs(self) -> RedisResult<Vec<(Self, Self)>> {
        match self {
            Self::Map(pairs) => Ok(pairs),
            Self::Array(items) if items.len() % 2 == 0 => {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Ok(pairs)
            }
            other => Err(RedisError::Type(format!(
                "Cannot convert {other:?} to map"
            ))),
        }
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Whether this frame is an out-of-band push
    #[must_use]
    pub const fn is_push(&self) -> bool {
        matches!(self, Self::Push(_))
    }

    /// Extract error message if this is an error
    #[must_use]
    pub fn into_error(self) -> Option<String> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Turn an error frame into `Err`, passing every other frame through
    ///
    /// # Errors
    ///
    /// Returns the server error (or parsed redirect) carried by the frame.
    pub fn into_result(self) -> RedisResult<Self> {
        match self {
            Self::Error(msg) => Err(RedisError::from_server_message(msg)),
            other => Ok(other),
        }
    }

    /// Name of the frame kind, for diagnostics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple-string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::Null => "null",
            Self::BulkString(_) => "bulk-string",
            Self::Verbatim { .. } => "verbatim-string",
            Self::BigNumber(_) => "big-number",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Push(_) => "push",
        }
    }

    /// Case-sensitive comparison of a string-ish frame against `expected`
    #[must_use]
    pub fn eq_str(&self, expected: &str) -> bool {
        match self {
            Self::SimpleString(s) => s == expected,
            Self::BulkString(b) => b.as_ref() == expected.as_bytes(),
            _ => false,
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}
impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}
impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}
impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}

impl TryFrom<RespValue> for String {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_string()
    }
}

impl TryFrom<RespValue> for i64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_int()
    }
}

impl TryFrom<RespValue> for f64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_f64()
    }
}

impl TryFrom<RespValue> for Bytes {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_bytes()
    }
}

impl TryFrom<RespValue> for bool {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        match value {
            RespValue::Integer(1) | RespValue::Boolean(true) => Ok(true),
            RespValue::Integer(0) | RespValue::Boolean(false) | RespValue::Null => Ok(false),
            RespValue::SimpleString(ref s) if s == "OK" => Ok(true),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to bool",
                value
            ))),
        }
    }
}

impl<T> TryFrom<RespValue> for Vec<T>
where
    T: TryFrom<RespValue, Error = RedisError>,
{
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        match value {
            RespValue::Array(items) | RespValue::Set(items) | RespValue::Push(items) => {
                items.into_iter().map(T::try_from).collect()
            }
            RespValue::Null => Ok(Vec::new()),
            other => Err(RedisError::Type(format!(
                "Cannot convert {other:?} to list"
            ))),
        }
    }
}
