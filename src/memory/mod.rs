//! Memory management: the budgeted arena and the key/value cache.

pub mod arena;
pub mod kv_cache;

pub use arena::{
    Allocation, Arena, ArenaError, ArenaHandle, ArenaLease, Bucket, HostBuffer, MemorySpace, Owner,
    SizeClass,
};
pub use kv_cache::{KvCache, KvCacheError, KvElem, KvLayout, KvPrecision, KvView};
