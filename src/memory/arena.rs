//! Budgeted allocation arena.
//!
//! Every buffer the engine holds (mapped weights, activations, key/value
//! cache, per-session scratch) is charged here against a fixed budget and
//! recorded in a manifest under its owner. Unload walks the manifest with
//! [`Arena::release_all`].

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::telemetry;

const SMALL_LIMIT: usize = 4 * 1024;
const LARGE_LIMIT: usize = 64 * 1024 * 1024;
const LINE: usize = 64;
const PAGE: usize = 4 * 1024;
const HUGE_PAGE: usize = 2 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Out of memory: {owner} requested {requested} bytes, {remaining} of {budget} remaining")]
    OutOfMemory {
        owner: Owner,
        requested: usize,
        remaining: usize,
        budget: usize,
    },

    #[error("Unknown or already released arena handle {0}")]
    UnknownHandle(ArenaHandle),
}

/// Component that owns an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Owner {
    Weights,
    Activations,
    KvCache,
    Session,
    Kernels,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Owner::Weights => "weights",
            Owner::Activations => "activations",
            Owner::KvCache => "kv-cache",
            Owner::Session => "session",
            Owner::Kernels => "kernels",
        };
        f.write_str(s)
    }
}

/// Where the bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemorySpace {
    /// Heap memory owned by the process.
    Host,
    /// File-backed read-only mapping.
    Mapped,
    /// Accelerator-resident memory.
    Device,
}

/// Rounding bucket applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Bucket {
    /// Under 4 KiB, rounded to a cache line.
    Small,
    /// Up to 64 MiB, rounded to a page.
    Medium,
    /// Rounded to a 2 MiB huge page.
    Large,
}

/// A request size and the bucket that decides what is charged for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeClass {
    pub bucket: Bucket,
    pub bytes: usize,
}

impl SizeClass {
    pub fn for_bytes(bytes: usize) -> Self {
        let bucket = if bytes < SMALL_LIMIT {
            Bucket::Small
        } else if bytes <= LARGE_LIMIT {
            Bucket::Medium
        } else {
            Bucket::Large
        };
        Self { bucket, bytes }
    }

    /// Size class for `len` values of `T`.
    pub fn for_elements<T>(len: usize) -> Self {
        Self::for_bytes(len.saturating_mul(std::mem::size_of::<T>()))
    }

    /// Bytes charged against the budget.
    pub fn charged(&self) -> usize {
        let granule = match self.bucket {
            Bucket::Small => LINE,
            Bucket::Medium => PAGE,
            Bucket::Large => HUGE_PAGE,
        };
        self.bytes.div_ceil(granule).saturating_mul(granule)
    }
}

/// Opaque allocation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArenaHandle(u64);

impl fmt::Display for ArenaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub handle: ArenaHandle,
    pub owner: Owner,
    pub space: MemorySpace,
    pub size: SizeClass,
    pub charged: usize,
}

#[derive(Default)]
struct ArenaInner {
    used: usize,
    peak: usize,
    next_id: u64,
    manifest: HashMap<ArenaHandle, Allocation>,
}

/// Budgeted allocation tracker shared by every engine component.
pub struct Arena {
    budget: usize,
    inner: Mutex<ArenaInner>,
}

impl Arena {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    /// Reserve host memory for `owner`.
    pub fn allocate(&self, size: SizeClass, owner: Owner) -> Result<ArenaHandle, ArenaError> {
        self.allocate_in(size, owner, MemorySpace::Host)
    }

    /// Reserve memory in a specific space.
    pub fn allocate_in(
        &self,
        size: SizeClass,
        owner: Owner,
        space: MemorySpace,
    ) -> Result<ArenaHandle, ArenaError> {
        let charged = size.charged();
        let mut inner = self.inner.lock();
        let remaining = self.budget.saturating_sub(inner.used);
        if charged > remaining {
            tracing::warn!(%owner, requested = charged, remaining, budget = self.budget, "arena budget exhausted");
            return Err(ArenaError::OutOfMemory {
                owner,
                requested: charged,
                remaining,
                budget: self.budget,
            });
        }
        inner.next_id += 1;
        let handle = ArenaHandle(inner.next_id);
        inner.used += charged;
        inner.peak = inner.peak.max(inner.used);
        inner.manifest.insert(
            handle,
            Allocation {
                handle,
                owner,
                space,
                size,
                charged,
            },
        );
        telemetry::record_arena_usage(inner.used, self.budget);
        Ok(handle)
    }

    /// Return an allocation's bytes to the budget.
    pub fn release(&self, handle: ArenaHandle) -> Result<(), ArenaError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .manifest
            .remove(&handle)
            .ok_or(ArenaError::UnknownHandle(handle))?;
        inner.used -= entry.charged;
        telemetry::record_arena_usage(inner.used, self.budget);
        Ok(())
    }

    /// Release every tracked allocation. Returns how many were freed;
    /// calling again on an empty manifest is a no-op returning zero.
    pub fn release_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.manifest.len();
        let freed: usize = inner.manifest.drain().map(|(_, a)| a.charged).sum();
        inner.used -= freed;
        debug_assert_eq!(inner.used, 0);
        if count > 0 {
            tracing::debug!(count, freed, "arena released");
        }
        telemetry::record_arena_usage(inner.used, self.budget);
        count
    }

    /// Allocate a zeroed host buffer of `len` values.
    pub fn alloc_host<T: Copy + Default>(&self, len: usize, owner: Owner) -> Result<HostBuffer<T>, ArenaError> {
        let handle = self.allocate(SizeClass::for_elements::<T>(len), owner)?;
        Ok(HostBuffer {
            handle,
            data: vec![T::default(); len],
        })
    }

    /// Allocation released automatically when the lease is dropped.
    pub fn lease(&self, size: SizeClass, owner: Owner) -> Result<ArenaLease<'_>, ArenaError> {
        let handle = self.allocate(size, owner)?;
        Ok(ArenaLease { arena: self, handle })
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn budget_remaining(&self) -> usize {
        self.budget.saturating_sub(self.inner.lock().used)
    }

    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    pub fn peak(&self) -> usize {
        self.inner.lock().peak
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.inner.lock().manifest.len()
    }

    /// Snapshot of the manifest ordered by handle.
    pub fn manifest(&self) -> Vec<Allocation> {
        let mut entries: Vec<_> = self.inner.lock().manifest.values().cloned().collect();
        entries.sort_by_key(|a| a.handle);
        entries
    }

    /// Charged bytes for one owner.
    pub fn used_by(&self, owner: Owner) -> usize {
        self.inner
            .lock()
            .manifest
            .values()
            .filter(|a| a.owner == owner)
            .map(|a| a.charged)
            .sum()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Arena")
            .field("budget", &self.budget)
            .field("used", &inner.used)
            .field("live", &inner.manifest.len())
            .finish()
    }
}

/// Host buffer whose bytes are charged to the arena.
///
/// Dropping the buffer frees the heap memory; the arena entry is released
/// through the manifest.
#[derive(Debug)]
pub struct HostBuffer<T> {
    handle: ArenaHandle,
    data: Vec<T>,
}

impl<T> HostBuffer<T> {
    pub fn handle(&self) -> ArenaHandle {
        self.handle
    }
}

impl<T> Deref for HostBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for HostBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// Scoped allocation released on drop.
pub struct ArenaLease<'a> {
    arena: &'a Arena,
    handle: ArenaHandle,
}

impl ArenaLease<'_> {
    pub fn handle(&self) -> ArenaHandle {
        self.handle
    }
}

impl Drop for ArenaLease<'_> {
    fn drop(&mut self) {
        // A concurrent release_all may already have reclaimed the entry.
        let _ = self.arena.release(self.handle);
    }
}
