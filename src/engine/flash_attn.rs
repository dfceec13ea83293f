//! CPU Flash Attention over the key/value cache.
//!
//! Single-query attention for one head, computed in tiles with the online
//! softmax recurrence so no score vector longer than one tile is held.
//! Cached keys and values may be stored in f32 or f16.

use super::device::AcceleratorFamily;
use super::simd_matmul;
use crate::memory::KvElem;

/// Configuration for Flash Attention.
#[derive(Debug, Clone)]
pub struct FlashAttnConfig {
    /// Tile size for blocked computation.
    pub block_size: usize,
    /// Dimension of each attention head.
    pub head_dim: usize,
}

impl Default for FlashAttnConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            head_dim: 64,
        }
    }
}

/// Reusable buffers so the decode loop does not allocate per head.
#[derive(Debug, Clone)]
pub struct AttnScratch {
    scores: Vec<f32>,
    acc: Vec<f32>,
    row: Vec<f32>,
}

impl AttnScratch {
    pub fn new(config: &FlashAttnConfig) -> Self {
        Self {
            scores: vec![0.0; config.block_size],
            acc: vec![0.0; config.head_dim],
            row: vec![0.0; config.head_dim],
        }
    }
}

/// CPU Flash Attention with tiled computation.
#[derive(Debug, Clone)]
pub struct FlashAttn {
    config: FlashAttnConfig,
    family: AcceleratorFamily,
    scale: f32,
}

impl FlashAttn {
    pub fn new(config: FlashAttnConfig, family: AcceleratorFamily) -> Self {
        let scale = 1.0 / (config.head_dim as f32).sqrt();
        Self {
            config,
            family,
            scale,
        }
    }

    pub fn config(&self) -> &FlashAttnConfig {
        &self.config
    }

    /// Compute attention output for one query head.
    ///
    /// # Arguments
    /// * `query` - Query vector [head_dim]
    /// * `keys` - Key vectors flattened [seq_len * head_dim]
    /// * `values` - Value vectors flattened [seq_len * head_dim]
    /// * `output` - Output buffer [head_dim]
    pub fn forward<T: KvElem>(
        &self,
        query: &[f32],
        keys: &[T],
        values: &[T],
        output: &mut [f32],
        scratch: &mut AttnScratch,
    ) {
        let head_dim = self.config.head_dim;
        let seq_len = keys.len() / head_dim;
        output[..head_dim].fill(0.0);
        if seq_len == 0 {
            return;
        }

        let block_size = self.config.block_size;
        let mut global_max = f32::NEG_INFINITY;
        let mut global_sum = 0.0f32;
        scratch.acc.fill(0.0);

        for start in (0..seq_len).step_by(block_size) {
            let block_len = block_size.min(seq_len - start);

            // Scores for this tile.
            let mut block_max = f32::NEG_INFINITY;
            for i in 0..block_len {
                let off = (start + i) * head_dim;
                widen(&keys[off..off + head_dim], &mut scratch.row);
                let s = simd_matmul::dot_f32(self.family, query, &scratch.row) * self.scale;
                scratch.scores[i] = s;
                block_max = block_max.max(s);
            }

            // Rescale what has been accumulated so far to the new maximum.
            let new_max = global_max.max(block_max);
            let correction = if global_max == f32::NEG_INFINITY {
                0.0
            } else {
                (global_max - new_max).exp()
            };
            global_sum *= correction;
            for a in scratch.acc.iter_mut() {
                *a *= correction;
            }

            for i in 0..block_len {
                let w = (scratch.scores[i] - new_max).exp();
                global_sum += w;
                let off = (start + i) * head_dim;
                for (a, v) in scratch.acc.iter_mut().zip(&values[off..off + head_dim]) {
                    *a += w * v.to_f32();
                }
            }
            global_max = new_max;
        }

        if global_sum > 0.0 {
            for (o, a) in output.iter_mut().zip(&scratch.acc) {
                *o = a / global_sum;
            }
        }
    }
}

#[inline]
fn widen<T: KvElem>(src: &[T], dst: &mut [f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.to_f32();
    }
}

/// Untiled reference used by kernel self-tests.
pub fn attention_reference(query: &[f32], keys: &[f32], values: &[f32], head_dim: usize, output: &mut [f32]) {
    let seq_len = keys.len() / head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let scores: Vec<f32> = (0..seq_len)
        .map(|t| {
            let k = &keys[t * head_dim..(t + 1) * head_dim];
            k.iter().zip(query).map(|(a, b)| a * b).sum::<f32>() * scale
        })
        .collect();
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = weights.iter().sum();
    output[..head_dim].fill(0.0);
    for (t, w) in weights.iter().enumerate() {
        for d in 0..head_dim {
            output[d] += w / sum * values[t * head_dim + d];
        }
    }
}
