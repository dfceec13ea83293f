//! Key/value cache for autoregressive decoding.
//!
//! One key buffer and one value buffer per layer, laid out
//! `[kv_head][position][head_dim]` so a head's history is contiguous for the
//! attention kernel. Storage is f32 or f16 depending on the precision chosen
//! for the device; reads go through [`KvElem`] so kernels never copy.

use half::f16;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::arena::{Arena, ArenaError, HostBuffer, Owner};

/// Element encoding for cached keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KvPrecision {
    F32,
    F16,
}

impl KvPrecision {
    pub fn bytes_per_element(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }
}

/// Scalar types the cache can store.
pub trait KvElem: Copy + Default + Send + Sync + 'static {
    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl KvElem for f32 {
    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl KvElem for f16 {
    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvCacheError {
    #[error("KV cache full: capacity {capacity} positions")]
    Full { capacity: usize },

    #[error("KV write out of order: expected position {expected}, got {got}")]
    OutOfOrder { expected: usize, got: usize },

    #[error("KV vector has {got} values, expected {expected}")]
    WidthMismatch { expected: usize, got: usize },
}

/// Cache geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvLayout {
    pub n_layers: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    /// Maximum positions (context length).
    pub capacity: usize,
}

impl KvLayout {
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Elements per layer buffer, or None when the geometry overflows.
    fn layer_elements(&self) -> Option<usize> {
        self.n_kv_heads
            .checked_mul(self.head_dim)?
            .checked_mul(self.capacity)
    }

    /// Total bytes for keys and values across all layers, or None when the
    /// geometry overflows.
    pub fn bytes(&self, precision: KvPrecision) -> Option<usize> {
        self.layer_elements()?
            .checked_mul(self.n_layers)?
            .checked_mul(2 * precision.bytes_per_element())
    }
}

struct LayerStore<T> {
    keys: HostBuffer<T>,
    values: HostBuffer<T>,
}

enum Storage {
    F32(Vec<LayerStore<f32>>),
    F16(Vec<LayerStore<f16>>),
}

/// A head's cached history, borrowed for attention.
pub enum KvView<'a> {
    F32 { keys: &'a [f32], values: &'a [f32] },
    F16 { keys: &'a [f16], values: &'a [f16] },
}

/// Per-layer key/value cache for one generation session.
pub struct KvCache {
    layout: KvLayout,
    precision: KvPrecision,
    storage: Storage,
    len: usize,
}

impl KvCache {
    /// Allocate all layer buffers through the arena.
    pub fn new(arena: &Arena, layout: KvLayout, precision: KvPrecision) -> Result<Self, ArenaError> {
        if layout.bytes(precision).is_none() {
            return Err(ArenaError::OutOfMemory {
                owner: Owner::KvCache,
                requested: usize::MAX,
                remaining: arena.budget_remaining(),
                budget: arena.budget(),
            });
        }
        let storage = match precision {
            KvPrecision::F32 => Storage::F32(alloc_layers(arena, &layout)?),
            KvPrecision::F16 => Storage::F16(alloc_layers(arena, &layout)?),
        };
        Ok(Self {
            layout,
            precision,
            storage,
            len: 0,
        })
    }

    /// Write the key and value for `pos` in `layer`. `pos` must be the next
    /// unfilled position; the position becomes visible after [`advance`].
    ///
    /// [`advance`]: KvCache::advance
    pub fn store(&mut self, layer: usize, pos: usize, key: &[f32], value: &[f32]) -> Result<(), KvCacheError> {
        let kv_dim = self.layout.kv_dim();
        if pos >= self.layout.capacity {
            return Err(KvCacheError::Full {
                capacity: self.layout.capacity,
            });
        }
        if pos != self.len {
            return Err(KvCacheError::OutOfOrder {
                expected: self.len,
                got: pos,
            });
        }
        if key.len() != kv_dim || value.len() != kv_dim {
            return Err(KvCacheError::WidthMismatch {
                expected: kv_dim,
                got: key.len().min(value.len()),
            });
        }
        let layout = self.layout;
        match &mut self.storage {
            Storage::F32(layers) => write_position(&mut layers[layer], &layout, pos, key, value),
            Storage::F16(layers) => write_position(&mut layers[layer], &layout, pos, key, value),
        }
        Ok(())
    }

    /// Commit one position after every layer has stored it.
    pub fn advance(&mut self) -> Result<(), KvCacheError> {
        if self.len >= self.layout.capacity {
            return Err(KvCacheError::Full {
                capacity: self.layout.capacity,
            });
        }
        self.len += 1;
        Ok(())
    }

    /// History for one head covering positions `0..upto`.
    pub fn view(&self, layer: usize, kv_head: usize, upto: usize) -> KvView<'_> {
        let head_dim = self.layout.head_dim;
        let start = kv_head * self.layout.capacity * head_dim;
        let end = start + upto * head_dim;
        match &self.storage {
            Storage::F32(layers) => KvView::F32 {
                keys: &layers[layer].keys[start..end],
                values: &layers[layer].values[start..end],
            },
            Storage::F16(layers) => KvView::F16 {
                keys: &layers[layer].keys[start..end],
                values: &layers[layer].values[start..end],
            },
        }
    }

    /// Forget all positions. Buffers stay allocated.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Positions processed so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.layout.capacity
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn layout(&self) -> &KvLayout {
        &self.layout
    }

    pub fn precision(&self) -> KvPrecision {
        self.precision
    }

    pub fn bytes(&self) -> usize {
        // Checked when the cache was allocated.
        self.layout.bytes(self.precision).unwrap_or(usize::MAX)
    }
}

fn alloc_layers<T: KvElem>(arena: &Arena, layout: &KvLayout) -> Result<Vec<LayerStore<T>>, ArenaError> {
    let n = layout.layer_elements().unwrap_or(0);
    (0..layout.n_layers)
        .map(|_| {
            Ok(LayerStore {
                keys: arena.alloc_host(n, Owner::KvCache)?,
                values: arena.alloc_host(n, Owner::KvCache)?,
            })
        })
        .collect()
}

fn write_position<T: KvElem>(store: &mut LayerStore<T>, layout: &KvLayout, pos: usize, key: &[f32], value: &[f32]) {
    let hd = layout.head_dim;
    for h in 0..layout.n_kv_heads {
        let dst = (h * layout.capacity + pos) * hd;
        let src = h * hd;
        for i in 0..hd {
            store.keys[dst + i] = T::from_f32(key[src + i]);
            store.values[dst + i] = T::from_f32(value[src + i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> KvLayout {
        KvLayout {
            n_layers: 2,
            n_kv_heads: 2,
            head_dim: 4,
            capacity: 3,
        }
    }

    #[test]
    fn store_and_view_by_head() {
        let arena = Arena::new(1 << 20);
        let mut cache = KvCache::new(&arena, layout(), KvPrecision::F32).unwrap();
        let k: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let v: Vec<f32> = (0..8).map(|i| -(i as f32)).collect();
        for layer in 0..2 {
            cache.store(layer, 0, &k, &v).unwrap();
        }
        cache.advance().unwrap();

        match cache.view(1, 1, cache.len()) {
            KvView::F32 { keys, values } => {
                assert_eq!(keys, &[4.0, 5.0, 6.0, 7.0]);
                assert_eq!(values, &[-4.0, -5.0, -6.0, -7.0]);
            }
            KvView::F16 { .. } => panic!("expected f32 storage"),
        }
    }

    #[test]
    fn rejects_out_of_order_and_overflow() {
        let arena = Arena::new(1 << 20);
        let mut cache = KvCache::new(&arena, layout(), KvPrecision::F16).unwrap();
        let x = [0.5f32; 8];
        assert_eq!(
            cache.store(0, 1, &x, &x),
            Err(KvCacheError::OutOfOrder { expected: 0, got: 1 })
        );
        for pos in 0..3 {
            cache.store(0, pos, &x, &x).unwrap();
            cache.advance().unwrap();
        }
        assert!(cache.is_full());
        assert_eq!(cache.store(0, 3, &x, &x), Err(KvCacheError::Full { capacity: 3 }));
        assert_eq!(cache.advance(), Err(KvCacheError::Full { capacity: 3 }));
    }

    #[test]
    fn clear_resets_length_only() {
        let arena = Arena::new(1 << 20);
        let mut cache = KvCache::new(&arena, layout(), KvPrecision::F32).unwrap();
        let used = arena.used();
        let x = [1.0f32; 8];
        cache.store(0, 0, &x, &x).unwrap();
        cache.advance().unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(arena.used(), used);
    }

    #[test]
    fn buffers_are_charged_to_kv_owner() {
        let arena = Arena::new(1 << 20);
        let cache = KvCache::new(&arena, layout(), KvPrecision::F16).unwrap();
        assert_eq!(arena.live(), 4);
        assert!(arena.used_by(Owner::KvCache) >= cache.bytes());
    }

    #[test]
    fn overflowing_geometry_is_out_of_memory() {
        let arena = Arena::new(1 << 20);
        let huge = KvLayout {
            capacity: 1 << 62,
            ..layout()
        };
        assert_eq!(huge.bytes(KvPrecision::F32), None);
        let err = KvCache::new(&arena, huge, KvPrecision::F32).err().unwrap();
        assert!(matches!(err, ArenaError::OutOfMemory { owner: Owner::KvCache, .. }));
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn f16_round_trips_representable_values() {
        assert_eq!(<f16 as KvElem>::from_f32(0.25).to_f32(), 0.25);
    }
}
