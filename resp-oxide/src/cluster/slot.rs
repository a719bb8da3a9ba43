//! Hash slots and the immutable slot map
//!
//! Keys are hashed with CRC16 (XMODEM) modulo 16384. If a key contains a
//! non-empty `{...}` section, only that section is hashed, so
//! `{user1000}.following` and `{user1000}.followers` share a slot.

use crate::command::Cmd;
use crc16::{State, XMODEM};
use resp_oxide_core::{
    config::Endpoint,
    error::{RedisError, RedisResult},
    types::{NodeInfo, SlotRange},
    value::RespValue,
};
use std::collections::{BTreeSet, HashMap};

/// Total number of hash slots in Redis Cluster
pub const SLOT_COUNT: u16 = 16384;

/// Calculate the hash slot for a given key
#[must_use]
pub fn key_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT
}

fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// Slot shared by every key of `cmd`
///
/// Returns `Ok(None)` for keyless commands.
///
/// # Errors
///
/// Returns [`RedisError::CrossSlot`] when the keys hash to different slots.
pub fn command_slot(cmd: &Cmd) -> RedisResult<Option<u16>> {
    let mut slot = None;
    for key in cmd.keys() {
        let key_slot = key_slot(key);
        match slot {
            None => slot = Some(key_slot),
            Some(existing) if existing != key_slot => {
                return Err(RedisError::CrossSlot {
                    command: cmd.name().to_string(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// One primary and its replicas, by `host:port` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Primary address
    pub primary: String,
    /// Replica addresses
    pub replicas: Vec<String>,
}

impl Shard {
    /// Shard without replicas
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            replicas: Vec::new(),
        }
    }
}

/// Slot ownership snapshot
///
/// A map is never changed once published; updates build a new map that
/// replaces the old one wholesale.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: Vec<Option<usize>>,
    shards: Vec<Shard>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self {
            slots: vec![None; usize::from(SLOT_COUNT)],
            shards: Vec::new(),
        }
    }
}

impl SlotMap {
    /// Build a map from explicit ranges
    pub fn from_ranges(ranges: impl IntoIterator<Item = (SlotRange, Shard)>) -> Self {
        let mut map = Self::default();
        for (range, shard) in ranges {
            let index = map.shard_index(shard);
            for slot in range.start..=range.end.min(SLOT_COUNT - 1) {
                map.slots[usize::from(slot)] = Some(index);
            }
        }
        map
    }

    /// Parse a `CLUSTER SLOTS` reply
    ///
    /// Entries whose host is empty or `?` (or null) refer to the node that
    /// answered, whose host is `contacted_host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is not shaped like a `CLUSTER SLOTS` reply.
    pub fn from_cluster_slots(reply: &RespValue, contacted_host: &str) -> RedisResult<Self> {
        let entries = reply
            .as_array()
            .map_err(|_| RedisError::Cluster("CLUSTER SLOTS reply is not an array".into()))?;

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let fields = entry
                .as_array()
                .map_err(|_| RedisError::Cluster("CLUSTER SLOTS entry is not an array".into()))?;
            if fields.len() < 3 {
                return Err(RedisError::Cluster(format!(
                    "CLUSTER SLOTS entry has {} fields",
                    fields.len()
                )));
            }
            let start = slot_number(&fields[0])?;
            let end = slot_number(&fields[1])?;
            let primary = node_address(&fields[2], contacted_host)?;
            let replicas = fields[3..]
                .iter()
                .map(|node| node_address(node, contacted_host))
                .collect::<RedisResult<Vec<_>>>()?;
            ranges.push((SlotRange::new(start, end), Shard { primary, replicas }));
        }
        Ok(Self::from_ranges(ranges))
    }

    fn shard_index(&mut self, shard: Shard) -> usize {
        if let Some(index) = self.shards.iter().position(|s| s.primary == shard.primary) {
            let existing = &mut self.shards[index];
            for replica in shard.replicas {
                if !existing.replicas.contains(&replica) {
                    existing.replicas.push(replica);
                }
            }
            index
        } else {
            self.shards.push(shard);
            self.shards.len() - 1
        }
    }

    /// Shard owning `slot`
    #[must_use]
    pub fn shard_for_slot(&self, slot: u16) -> Option<&Shard> {
        self.slots
            .get(usize::from(slot))
            .copied()
            .flatten()
            .map(|index| &self.shards[index])
    }

    /// Primary address owning `slot`
    #[must_use]
    pub fn primary_for_slot(&self, slot: u16) -> Option<&str> {
        self.shard_for_slot(slot).map(|shard| shard.primary.as_str())
    }

    /// Copy of this map with `slot` handed to `primary`
    #[must_use]
    pub fn with_slot_owner(&self, slot: u16, primary: &str) -> Self {
        let mut map = self.clone();
        let index = map.shard_index(Shard::new(primary));
        if let Some(entry) = map.slots.get_mut(usize::from(slot)) {
            *entry = Some(index);
        }
        map
    }

    /// Primaries that own at least one slot
    #[must_use]
    pub fn primaries(&self) -> Vec<&str> {
        let mut used = vec![false; self.shards.len()];
        for index in self.slots.iter().flatten() {
            used[*index] = true;
        }
        self.shards
            .iter()
            .zip(used)
            .filter(|(_, used)| *used)
            .map(|(shard, _)| shard.primary.as_str())
            .collect()
    }

    /// Every primary and replica address
    #[must_use]
    pub fn addresses(&self) -> BTreeSet<String> {
        self.shards
            .iter()
            .flat_map(|shard| std::iter::once(&shard.primary).chain(&shard.replicas))
            .cloned()
            .collect()
    }

    /// Whether every slot has an owner
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Whether no slot has an owner
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Node descriptions with the contiguous slot ranges each serves
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut ranges: HashMap<usize, Vec<SlotRange>> = HashMap::new();
        let mut slot = 0u16;
        while slot < SLOT_COUNT {
            let owner = self.slots[usize::from(slot)];
            let start = slot;
            while slot + 1 < SLOT_COUNT && self.slots[usize::from(slot + 1)] == owner {
                slot += 1;
            }
            if let Some(index) = owner {
                ranges
                    .entry(index)
                    .or_default()
                    .push(SlotRange::new(start, slot));
            }
            slot += 1;
        }

        let mut nodes = Vec::new();
        for (index, shard) in self.shards.iter().enumerate() {
            let slots = ranges.remove(&index).unwrap_or_default();
            for (address, is_master) in std::iter::once((&shard.primary, true))
                .chain(shard.replicas.iter().map(|replica| (replica, false)))
            {
                let Ok(Endpoint::Tcp { host, port }) = Endpoint::parse(address) else {
                    continue;
                };
                let mut node = NodeInfo::new(String::new(), host, port);
                node.slots = slots.clone();
                node.is_master = is_master;
                nodes.push(node);
            }
        }
        nodes
    }
}

fn slot_number(value: &RespValue) -> RedisResult<u16> {
    value
        .as_int()
        .ok()
        .and_then(|n| u16::try_from(n).ok())
        .filter(|n| *n < SLOT_COUNT)
        .ok_or_else(|| RedisError::Cluster(format!("Invalid slot number: {value:?}")))
}

fn node_address(value: &RespValue, contacted_host: &str) -> RedisResult<String> {
    let fields = value
        .as_array()
        .map_err(|_| RedisError::Cluster("Node entry is not an array".into()))?;
    if fields.len() < 2 {
        return Err(RedisError::Cluster("Node entry lacks host or port".into()));
    }
    let host = match fields[0].as_string() {
        Ok(host) if !host.is_empty() && host != "?" => host,
        _ => contacted_host.to_string(),
    };
    let port = fields[1]
        .as_int()
        .ok()
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| RedisError::Cluster(format!("Invalid port: {:?}", fields[1])))?;
    Ok(Endpoint::tcp(host, port).to_string())
}
