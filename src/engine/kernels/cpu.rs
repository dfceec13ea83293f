//! CPU kernel bodies.
//!
//! Each function is the executable form of one template. The `family`
//! argument selects the SIMD primitives; `Scalar` is the reference every
//! vector variant is checked against by [`self_test`].

use crate::engine::device::AcceleratorFamily;
use crate::engine::flash_attn::{attention_reference, AttnScratch, FlashAttn, FlashAttnConfig};
use crate::engine::quantize;
use crate::engine::simd_matmul;
use crate::memory::KvElem;
use crate::models::GgmlType;

use super::templates::{OpKind, Variant};

/// `out[r] = dot(row_r, x)` over an encoded row-major matrix.
pub fn matvec(
    family: AcceleratorFamily,
    tile: usize,
    ty: GgmlType,
    weights: &[u8],
    x: &[f32],
    out: &mut [f32],
    scratch: &mut [f32],
) {
    let row_len = quantize::row_bytes(ty, x.len());
    let tile = tile.max(1);
    for (t, out_tile) in out.chunks_mut(tile).enumerate() {
        let base = t * tile;
        for (i, o) in out_tile.iter_mut().enumerate() {
            let start = (base + i) * row_len;
            *o = quantize::dot_row(family, ty, &weights[start..start + row_len], x, scratch);
        }
    }
}

/// Root-mean-square normalisation with a learned gain.
pub fn rmsnorm(family: AcceleratorFamily, x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) {
    let ss = simd_matmul::dot_f32(family, x, x) / x.len() as f32;
    let scale = 1.0 / (ss + eps).sqrt();
    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = v * scale * w;
    }
}

/// Rotate interleaved pairs `(x[2i], x[2i+1])` of every head by `pos * inv_freq[i]`.
pub fn rope(x: &mut [f32], head_dim: usize, pos: usize, inv_freq: &[f32]) {
    for head in x.chunks_mut(head_dim) {
        for (i, &f) in inv_freq.iter().enumerate() {
            let angle = pos as f32 * f;
            let (sin, cos) = angle.sin_cos();
            let a = head[2 * i];
            let b = head[2 * i + 1];
            head[2 * i] = a * cos - b * sin;
            head[2 * i + 1] = a * sin + b * cos;
        }
    }
}

/// Inverse frequencies `base^(-2i/head_dim)` for RoPE.
pub fn rope_inv_freq(head_dim: usize, base: f32) -> Vec<f32> {
    (0..head_dim / 2)
        .map(|i| 1.0 / base.powf(2.0 * i as f32 / head_dim as f32))
        .collect()
}

/// Numerically stable in-place softmax.
pub fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return;
    }
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

/// `gate = silu(gate) * up`.
pub fn silu_mul(gate: &mut [f32], up: &[f32]) {
    for (g, &u) in gate.iter_mut().zip(up) {
        *g = *g / (1.0 + (-*g).exp()) * u;
    }
}

/// `dst += src`.
pub fn residual_add(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// Decode one embedding row.
pub fn embedding(ty: GgmlType, table: &[u8], token: usize, out: &mut [f32]) {
    let row_len = quantize::row_bytes(ty, out.len());
    let start = token * row_len;
    quantize::dequantize_row(ty, &table[start..start + row_len], out);
}

/// One-head attention over cached keys and values.
pub fn attention<T: KvElem>(
    attn: &FlashAttn,
    query: &[f32],
    keys: &[T],
    values: &[T],
    out: &mut [f32],
    scratch: &mut AttnScratch,
) {
    attn.forward(query, keys, values, out, scratch);
}

// -- Self-test ----------------------------------------------------------------

const PROBE_COLS: usize = 64;
const PROBE_ROWS: usize = 24;

fn probe(n: usize, seed: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 * 0.618 + seed) * 1.7).sin() * 0.5).collect()
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| if x.is_finite() && y.is_finite() { (x - y).abs() } else { f32::INFINITY })
        .fold(0.0, f32::max)
}

/// Run `variant` of `op` on a fixed probe and return the largest deviation
/// from the scalar reference. Non-finite output yields infinity.
pub fn self_test(op: OpKind, variant: Variant, tile: usize) -> f32 {
    let family = variant.family();
    let x = probe(PROBE_COLS, 0.3);
    match op {
        OpKind::MatmulF32 | OpKind::MatmulF16 | OpKind::MatmulQ8_0 | OpKind::MatmulQ4_0 => {
            let ty = op.weight_type().unwrap_or(GgmlType::F32);
            let w = probe(PROBE_ROWS * PROBE_COLS, 1.1);
            let enc = match ty {
                GgmlType::F16 => quantize::encode_f16(&w),
                GgmlType::Q8_0 => quantize::quantize_q8_0(&w),
                GgmlType::Q4_0 => quantize::quantize_q4_0(&w),
                _ => quantize::encode_f32(&w),
            };
            let mut scratch = vec![0.0; PROBE_COLS];
            let mut got = vec![0.0; PROBE_ROWS];
            matvec(family, tile, ty, &enc, &x, &mut got, &mut scratch);

            let mut deq = vec![0.0; PROBE_ROWS * PROBE_COLS];
            quantize::dequantize_row(ty, &enc, &mut deq);
            let want: Vec<f32> = deq
                .chunks(PROBE_COLS)
                .map(|row| simd_matmul::dot_f32_scalar(row, &x))
                .collect();
            max_abs_diff(&got, &want)
        }
        OpKind::RmsNorm => {
            let w = probe(PROBE_COLS, 2.0);
            let mut got = vec![0.0; PROBE_COLS];
            let mut want = vec![0.0; PROBE_COLS];
            rmsnorm(family, &x, &w, 1e-5, &mut got);
            rmsnorm(AcceleratorFamily::Scalar, &x, &w, 1e-5, &mut want);
            max_abs_diff(&got, &want)
        }
        OpKind::Attention => {
            let head_dim = 16;
            let seq = 29;
            let q = probe(head_dim, 0.9);
            let k = probe(seq * head_dim, 1.3);
            let v = probe(seq * head_dim, 2.7);
            let config = FlashAttnConfig {
                block_size: tile.max(1),
                head_dim,
            };
            let attn = FlashAttn::new(config.clone(), family);
            let mut scratch = AttnScratch::new(&config);
            let mut got = vec![0.0; head_dim];
            let mut want = vec![0.0; head_dim];
            attention(&attn, &q, &k, &v, &mut got, &mut scratch);
            attention_reference(&q, &k, &v, head_dim, &mut want);
            max_abs_diff(&got, &want)
        }
        OpKind::Rope => {
            let inv = rope_inv_freq(16, 10_000.0);
            let mut got = x.clone();
            rope(&mut got, 16, 7, &inv);
            // Rotation preserves each pair's norm.
            let norm = |v: &[f32]| v.iter().map(|a| a * a).sum::<f32>();
            (norm(&got) - norm(&x)).abs()
        }
        OpKind::Softmax => {
            let mut got = x.clone();
            softmax(&mut got);
            let total: f32 = got.iter().sum();
            if got.iter().all(|p| *p >= 0.0) {
                (total - 1.0).abs()
            } else {
                f32::INFINITY
            }
        }
        OpKind::SiluMul => {
            let mut got = x.clone();
            let up = vec![1.0; PROBE_COLS];
            silu_mul(&mut got, &up);
            let want: Vec<f32> = x.iter().map(|v| v / (1.0 + (-v).exp())).collect();
            max_abs_diff(&got, &want)
        }
        OpKind::ResidualAdd => {
            let mut got = x.clone();
            residual_add(&mut got, &x);
            let want: Vec<f32> = x.iter().map(|v| v * 2.0).collect();
            max_abs_diff(&got, &want)
        }
        OpKind::Embedding => {
            let table = quantize::encode_f32(&probe(4 * PROBE_COLS, 0.1));
            let mut got = vec![0.0; PROBE_COLS];
            embedding(GgmlType::F32, &table, 2, &mut got);
            let want = probe(4 * PROBE_COLS, 0.1);
            max_abs_diff(&got, &want[2 * PROBE_COLS..3 * PROBE_COLS])
        }
    }
}

/// Allowed self-test deviation per op.
pub fn tolerance(op: OpKind) -> f32 {
    match op {
        OpKind::MatmulF32 | OpKind::MatmulF16 | OpKind::MatmulQ8_0 | OpKind::MatmulQ4_0 => 1e-3,
        OpKind::Attention | OpKind::Rope => 1e-4,
        _ => 1e-5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_variants_pass_self_test() {
        for op in OpKind::ALL {
            let err = self_test(op, Variant::Scalar, 16);
            assert!(err <= tolerance(op), "{} deviated by {}", op, err);
        }
    }

    #[test]
    fn softmax_is_a_distribution() {
        let mut x = vec![1.0, 2.0, 3.0];
        softmax(&mut x);
        assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(x[2] > x[1] && x[1] > x[0]);
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let inv = rope_inv_freq(4, 10_000.0);
        let mut x = vec![1.0, 2.0, 3.0, 4.0];
        rope(&mut x, 4, 0, &inv);
        assert_eq!(x, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn rmsnorm_unit_gain_normalises() {
        let x = vec![3.0, 4.0];
        let mut out = vec![0.0; 2];
        rmsnorm(AcceleratorFamily::Scalar, &x, &[1.0, 1.0], 0.0, &mut out);
        let rms = (12.5f32).sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-6);
    }

    #[test]
    fn matvec_tiles_cover_all_rows() {
        let w = quantize::encode_f32(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let mut out = vec![0.0; 3];
        let mut scratch = vec![0.0; 2];
        matvec(AcceleratorFamily::Scalar, 2, GgmlType::F32, &w, &[2.0, 3.0], &mut out, &mut scratch);
        assert_eq!(out, vec![2.0, 3.0, 5.0]);
    }
}
