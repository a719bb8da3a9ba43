//! Cluster support: slot hashing, the slot map and the router

mod router;
pub mod slot;

pub use router::ClusterRouter;
pub use slot::{command_slot, key_slot, Shard, SlotMap, SLOT_COUNT};
