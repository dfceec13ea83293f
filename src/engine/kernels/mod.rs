//! Kernel Provider: compiles op templates for the device and caches the
//! result on disk.
//!
//! A [`KernelSet`] holds one [`CompiledKernel`] per logical op. The execution
//! graph resolves every op it needs at build time, so a missing or failed
//! kernel surfaces during load rather than mid-generation.

pub mod cache;
pub mod cpu;
pub mod provider;
pub mod templates;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::device::AcceleratorFamily;

pub use provider::{KernelProvider, KernelProviderConfig};
pub use templates::{builtin_templates, KernelTemplate, OpKind, Variant, KERNEL_SOURCE_VERSION};

/// Kernel Provider failures.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel compile failed for {op}: {reason}")]
    Compile { op: OpKind, reason: String },

    #[error("kernel cache corrupt at {path}: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },

    #[error("kernel {0} is not in the compiled set")]
    Missing(OpKind),

    #[error("kernel cache I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// One op specialised for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledKernel {
    pub op: OpKind,
    pub variant: Variant,
    /// Tile size, bounded by the device's `max_tile`. 1 for untiled ops.
    pub tile: usize,
    pub revision: u32,
    /// Largest deviation from the scalar reference seen during self-test.
    pub self_test_error: f32,
}

impl CompiledKernel {
    pub fn family(&self) -> AcceleratorFamily {
        self.variant.family()
    }
}

/// Where a kernel set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KernelSource {
    Compiled,
    DiskCache,
    Memory,
}

/// Compiled kernels for one capability.
#[derive(Debug, Clone)]
pub struct KernelSet {
    key: String,
    kernels: BTreeMap<OpKind, CompiledKernel>,
    source: KernelSource,
}

impl KernelSet {
    pub(crate) fn new(key: String, kernels: Vec<CompiledKernel>, source: KernelSource) -> Self {
        Self {
            key,
            kernels: kernels.into_iter().map(|k| (k.op, k)).collect(),
            source,
        }
    }

    pub(crate) fn with_source(mut self, source: KernelSource) -> Self {
        self.source = source;
        self
    }

    /// Cache key this set was compiled under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source(&self) -> KernelSource {
        self.source
    }

    pub fn get(&self, op: OpKind) -> Result<&CompiledKernel, KernelError> {
        self.kernels.get(&op).ok_or(KernelError::Missing(op))
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledKernel> {
        self.kernels.values()
    }

    /// Bytes charged to the arena for this set's descriptors.
    pub fn footprint(&self) -> usize {
        self.kernels.len() * std::mem::size_of::<CompiledKernel>()
    }
}

// -- Profiling ----------------------------------------------------------------

#[derive(Default)]
struct OpCounter {
    calls: AtomicU64,
    nanos: AtomicU64,
}

/// Per-op invocation counts and cumulative time.
pub struct KernelProfile {
    counters: Vec<OpCounter>,
}

/// Snapshot row of a [`KernelProfile`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpTiming {
    pub op: OpKind,
    pub calls: u64,
    pub total: Duration,
}

impl Default for KernelProfile {
    fn default() -> Self {
        Self {
            counters: OpKind::ALL.iter().map(|_| OpCounter::default()).collect(),
        }
    }
}

impl KernelProfile {
    fn index(op: OpKind) -> usize {
        OpKind::ALL.iter().position(|o| *o == op).unwrap_or(0)
    }

    /// Time one kernel invocation until the guard drops.
    pub fn time(&self, op: OpKind) -> ProfileGuard<'_> {
        ProfileGuard {
            counter: &self.counters[Self::index(op)],
            start: Instant::now(),
        }
    }

    pub fn reset(&self) {
        for c in &self.counters {
            c.calls.store(0, Ordering::Relaxed);
            c.nanos.store(0, Ordering::Relaxed);
        }
    }

    /// Ops that ran at least once, in op order.
    pub fn snapshot(&self) -> Vec<OpTiming> {
        OpKind::ALL
            .iter()
            .zip(&self.counters)
            .filter_map(|(&op, c)| {
                let calls = c.calls.load(Ordering::Relaxed);
                (calls > 0).then(|| OpTiming {
                    op,
                    calls,
                    total: Duration::from_nanos(c.nanos.load(Ordering::Relaxed)),
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for KernelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}

pub struct ProfileGuard<'a> {
    counter: &'a OpCounter,
    start: Instant,
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        self.counter.calls.fetch_add(1, Ordering::Relaxed);
        self.counter
            .nanos
            .fetch_add(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}
