//! Uniform command record
//!
//! Every command, whatever its name, is a name plus byte-string arguments.
//! The only semantics the engine needs beyond that are which arguments are
//! keys (for slot hashing) and whether the command only reads (for replica
//! routing). Both come from a static table keyed by the upper-cased name and
//! can be overridden per command for anything the table does not know.
//!
//! ```
//! use resp_oxide::command::cmd;
//!
//! let set = cmd("SET").arg("user:1").arg("alice").arg("EX").arg(60);
//! assert_eq!(set.keys(), vec![&b"user:1"[..]]);
//! assert!(!set.is_read_only());
//! ```

use crate::protocol::RespEncoder;
use bytes::{Bytes, BytesMut};
use resp_oxide_core::types::RedisValue;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Which arguments of a command are keys
///
/// Positions count the command name as 0, matching the server's own
/// key-spec numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// No key arguments
    None,
    /// Keys from `first` to `last` every `step`; a negative `last` counts from the end
    Fixed {
        /// Position of the first key
        first: usize,
        /// Position of the last key; -1 is the last argument
        last: isize,
        /// Distance between keys
        step: usize,
    },
    /// Argument at `index` holds the key count; keys follow it
    NumKeys {
        /// Position of the count argument
        index: usize,
    },
    /// Keys are the first half of the arguments after `STREAMS`
    Streams,
}

impl KeySpec {
    const fn single() -> Self {
        Self::Fixed {
            first: 1,
            last: 1,
            step: 1,
        }
    }

    const fn all() -> Self {
        Self::Fixed {
            first: 1,
            last: -1,
            step: 1,
        }
    }
}

/// Static properties of a command name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    /// Key positions
    pub keys: KeySpec,
    /// Never modifies data
    pub read_only: bool,
    /// Enters or extends subscriber mode
    pub subscribe: bool,
    /// Leaves subscriptions
    pub unsubscribe: bool,
    /// Accepted while the connection is in subscriber mode
    pub allowed_subscribed: bool,
}

impl CommandInfo {
    const UNKNOWN: Self = Self {
        keys: KeySpec::None,
        read_only: false,
        subscribe: false,
        unsubscribe: false,
        allowed_subscribed: false,
    };

    const fn new(keys: KeySpec, read_only: bool) -> Self {
        Self {
            keys,
            read_only,
            ..Self::UNKNOWN
        }
    }

    /// Properties of `name` (case-insensitive); unknown names have no keys and count as writes
    #[must_use]
    pub fn lookup(name: &str) -> Self {
        command_table()
            .get(name.to_ascii_uppercase().as_str())
            .copied()
            .unwrap_or(Self::UNKNOWN)
    }
}

fn command_table() -> &'static HashMap<&'static str, CommandInfo> {
    static TABLE: OnceLock<HashMap<&'static str, CommandInfo>> = OnceLock::new();
    TABLE.get_or_init(build_command_table)
}

fn build_command_table() -> HashMap<&'static str, CommandInfo> {
    const SINGLE_KEY_READS: &[&str] = &[
        "GET", "STRLEN", "GETRANGE", "SUBSTR", "TTL", "PTTL", "EXPIRETIME", "PEXPIRETIME", "TYPE",
        "DUMP", "HGET", "HMGET", "HEXISTS", "HGETALL", "HKEYS", "HVALS", "HLEN", "HSTRLEN",
        "HRANDFIELD", "HSCAN", "LLEN", "LRANGE", "LINDEX", "LPOS", "SMEMBERS", "SISMEMBER",
        "SMISMEMBER", "SCARD", "SRANDMEMBER", "SSCAN", "ZSCORE", "ZMSCORE", "ZRANK", "ZREVRANK",
        "ZRANGE", "ZREVRANGE", "ZRANGEBYSCORE", "ZREVRANGEBYSCORE", "ZRANGEBYLEX",
        "ZREVRANGEBYLEX", "ZCARD", "ZCOUNT", "ZLEXCOUNT", "ZRANDMEMBER", "ZSCAN", "XLEN",
        "XRANGE", "XREVRANGE", "XPENDING", "GEOPOS", "GEODIST", "GEOHASH", "GEOSEARCH",
        "GEORADIUS_RO", "GEORADIUSBYMEMBER_RO", "BITCOUNT", "GETBIT", "BITPOS", "BITFIELD_RO",
        "SORT_RO", "LCS",
    ];
    const SINGLE_KEY_WRITES: &[&str] = &[
        "SET", "SETNX", "SETEX", "PSETEX", "GETSET", "GETDEL", "GETEX", "APPEND", "INCR", "DECR",
        "INCRBY", "DECRBY", "INCRBYFLOAT", "SETRANGE", "EXPIRE", "PEXPIRE", "EXPIREAT",
        "PEXPIREAT", "PERSIST", "RESTORE", "HSET", "HSETNX", "HMSET", "HDEL", "HINCRBY",
        "HINCRBYFLOAT", "LPUSH", "RPUSH", "LPUSHX", "RPUSHX", "LPOP", "RPOP", "LSET", "LREM",
        "LTRIM", "LINSERT", "SADD", "SREM", "SPOP", "ZADD", "ZREM", "ZINCRBY", "ZPOPMIN",
        "ZPOPMAX", "ZREMRANGEBYSCORE", "ZREMRANGEBYRANK", "ZREMRANGEBYLEX", "ZUNIONSTORE",
        "ZINTERSTORE", "ZDIFFSTORE", "ZRANGESTORE", "XADD", "XDEL", "XTRIM", "XACK", "XCLAIM",
        "XAUTOCLAIM", "XSETID", "PFADD", "GEOADD", "GEORADIUS", "GEORADIUSBYMEMBER", "SETBIT",
        "BITFIELD", "SORT", "GEOSEARCHSTORE",
    ];
    const MULTI_KEY_READS: &[&str] = &[
        "MGET", "EXISTS", "SINTER", "SUNION", "SDIFF", "SINTERCARD", "TOUCH", "PFCOUNT",
    ];
    const MULTI_KEY_WRITES: &[&str] = &[
        "DEL", "UNLINK", "PFMERGE", "SINTERSTORE", "SUNIONSTORE", "SDIFFSTORE", "RENAME",
        "RENAMENX", "RPOPLPUSH", "LMOVE", "SMOVE", "COPY", "WATCH", "BITOP",
    ];
    const BLOCKING_WRITES: &[&str] = &["BLPOP", "BRPOP", "BZPOPMIN", "BZPOPMAX", "BRPOPLPUSH"];
    const KEYLESS_READS: &[&str] = &[
        "PING", "ECHO", "INFO", "DBSIZE", "KEYS", "SCAN", "RANDOMKEY", "TIME", "LASTSAVE", "ROLE",
        "COMMAND", "LOLWUT",
    ];

    let mut table = HashMap::new();
    for name in SINGLE_KEY_READS {
        table.insert(*name, CommandInfo::new(KeySpec::single(), true));
    }
    for name in SINGLE_KEY_WRITES {
        table.insert(*name, CommandInfo::new(KeySpec::single(), false));
    }
    for name in MULTI_KEY_READS {
        table.insert(*name, CommandInfo::new(KeySpec::all(), true));
    }
    for name in MULTI_KEY_WRITES {
        table.insert(*name, CommandInfo::new(KeySpec::all(), false));
    }
    let all_but_timeout = KeySpec::Fixed {
        first: 1,
        last: -2,
        step: 1,
    };
    for name in BLOCKING_WRITES {
        table.insert(*name, CommandInfo::new(all_but_timeout, false));
    }
    for name in KEYLESS_READS {
        table.insert(*name, CommandInfo::new(KeySpec::None, true));
    }

    let pairs = KeySpec::Fixed {
        first: 1,
        last: -1,
        step: 2,
    };
    table.insert("MSET", CommandInfo::new(pairs, false));
    table.insert("MSETNX", CommandInfo::new(pairs, false));

    let second = KeySpec::Fixed {
        first: 2,
        last: 2,
        step: 1,
    };
    table.insert("OBJECT", CommandInfo::new(second, true));
    table.insert("XINFO", CommandInfo::new(second, true));
    table.insert("XGROUP", CommandInfo::new(second, false));
    table.insert("MEMORY", CommandInfo::new(second, true));

    let numkeys = KeySpec::NumKeys { index: 2 };
    for name in ["EVAL", "EVALSHA", "FCALL"] {
        table.insert(name, CommandInfo::new(numkeys, false));
    }
    for name in ["EVAL_RO", "EVALSHA_RO", "FCALL_RO"] {
        table.insert(name, CommandInfo::new(numkeys, true));
    }
    for name in ["ZUNION", "ZINTER", "ZDIFF", "ZINTERCARD", "LMPOP", "ZMPOP"] {
        table.insert(
            name,
            CommandInfo::new(KeySpec::NumKeys { index: 1 }, name.starts_with('Z') && name != "ZMPOP"),
        );
    }

    table.insert("XREAD", CommandInfo::new(KeySpec::Streams, true));
    table.insert("XREADGROUP", CommandInfo::new(KeySpec::Streams, false));

    for name in ["SUBSCRIBE", "PSUBSCRIBE", "SSUBSCRIBE"] {
        table.insert(
            name,
            CommandInfo {
                subscribe: true,
                allowed_subscribed: true,
                // Sharded channels hash like keys
                keys: if name == "SSUBSCRIBE" {
                    KeySpec::all()
                } else {
                    KeySpec::None
                },
                ..CommandInfo::UNKNOWN
            },
        );
    }
    for name in ["UNSUBSCRIBE", "PUNSUBSCRIBE", "SUNSUBSCRIBE"] {
        table.insert(
            name,
            CommandInfo {
                unsubscribe: true,
                allowed_subscribed: true,
                keys: if name == "SUNSUBSCRIBE" {
                    KeySpec::all()
                } else {
                    KeySpec::None
                },
                ..CommandInfo::UNKNOWN
            },
        );
    }
    for name in ["PING", "RESET", "QUIT"] {
        let info = table.entry(name).or_insert(CommandInfo::UNKNOWN);
        info.allowed_subscribed = true;
    }

    table
}

/// Start building a command
///
/// ```
/// use resp_oxide::command::cmd;
///
/// let get = cmd("GET").arg("key");
/// assert_eq!(get.name(), "GET");
/// ```
#[must_use]
pub fn cmd(name: &str) -> Cmd {
    Cmd::new(name)
}

/// A command: name, arguments, and the routing facts the engine needs
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    name: String,
    args: Vec<Bytes>,
    info: CommandInfo,
    keys_override: Option<KeySpec>,
    read_only_override: Option<bool>,
}

impl Cmd {
    /// Create a command without arguments
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
            info: CommandInfo::lookup(name),
            keys_override: None,
            read_only_override: None,
        }
    }

    /// Append an argument; arrays are flattened into several arguments
    #[must_use]
    pub fn arg(mut self, value: impl Into<RedisValue>) -> Self {
        value.into().write_args(&mut self.args);
        self
    }

    /// Append an argument in place
    pub fn push_arg(&mut self, value: impl Into<RedisValue>) -> &mut Self {
        value.into().write_args(&mut self.args);
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<RedisValue>,
    {
        for value in values {
            value.into().write_args(&mut self.args);
        }
        self
    }

    /// Override the key positions
    #[must_use]
    pub const fn with_keys(mut self, keys: KeySpec) -> Self {
        self.keys_override = Some(keys);
        self
    }

    /// Override whether the command only reads
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only_override = Some(read_only);
        self
    }

    /// Command name as given
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments after the name
    #[must_use]
    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Static properties looked up from the name
    #[must_use]
    pub const fn info(&self) -> CommandInfo {
        self.info
    }

    /// Whether replicas may serve this command
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only_override.unwrap_or(self.info.read_only)
    }

    /// SUBSCRIBE, PSUBSCRIBE or SSUBSCRIBE
    #[must_use]
    pub const fn is_subscribe(&self) -> bool {
        self.info.subscribe
    }

    /// UNSUBSCRIBE, PUNSUBSCRIBE or SUNSUBSCRIBE
    #[must_use]
    pub const fn is_unsubscribe(&self) -> bool {
        self.info.unsubscribe
    }

    /// Whether a connection in subscriber mode accepts this command
    #[must_use]
    pub const fn allowed_in_subscriber_mode(&self) -> bool {
        self.info.allowed_subscribed
    }

    /// Key arguments, in argument order
    #[must_use]
    pub fn keys(&self) -> Vec<&[u8]> {
        let spec = self.keys_override.unwrap_or(self.info.keys);
        // Position 0 is the name, so argument i sits at position i + 1
        let total = self.args.len() + 1;
        let at = |pos: usize| {
            pos.checked_sub(1)
                .and_then(|i| self.args.get(i))
                .map(|arg| &arg[..])
        };

        match spec {
            KeySpec::None => Vec::new(),
            KeySpec::Fixed { first, last, step } => {
                let last = if last < 0 {
                    total as isize + last
                } else {
                    last
                };
                if first == 0 || last < first as isize {
                    return Vec::new();
                }
                (first..=last as usize)
                    .step_by(step.max(1))
                    .filter_map(at)
                    .collect()
            }
            KeySpec::NumKeys { index } => {
                let count = at(index)
                    .and_then(|raw| std::str::from_utf8(raw).ok())
                    .and_then(|raw| raw.parse::<usize>().ok())
                    .unwrap_or(0);
                (index + 1..=index + count).filter_map(at).collect()
            }
            KeySpec::Streams => {
                let Some(marker) = self
                    .args
                    .iter()
                    .position(|arg| arg.eq_ignore_ascii_case(b"STREAMS"))
                else {
                    return Vec::new();
                };
                let rest = &self.args[marker + 1..];
                rest[..rest.len() / 2].iter().map(|arg| &arg[..]).collect()
            }
        }
    }

    /// Append this command's wire frame to `buf`
    pub fn write_frame(&self, buf: &mut BytesMut) {
        RespEncoder::encode_command(self.name.as_bytes(), &self.args, buf);
    }

    /// This command's wire frame
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_frame(&mut buf);
        buf.freeze()
    }
}
