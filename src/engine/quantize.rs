//! GGUF weight encodings: Q8_0, Q4_0, F16 and F32 rows.
//!
//! Weights stay encoded in the mapped file. Matmul kernels call
//! [`dot_row`] per output row, which decodes one block at a time and hands
//! the integer lanes to the SIMD primitives in `simd_matmul`.

use half::f16;

use super::device::AcceleratorFamily;
use super::simd_matmul;
use crate::models::types::{GgmlType, Q4_0_BLOCK_BYTES, Q8_0_BLOCK_BYTES, QK};

#[inline]
fn read_f16(bytes: &[u8]) -> f32 {
    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

// -- Encoding ---------------------------------------------------------------

pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn encode_f16(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| f16::from_f32(v).to_le_bytes())
        .collect()
}

/// Symmetric 8-bit quantization, 32 values per block.
pub fn quantize_q8_0(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(QK) * Q8_0_BLOCK_BYTES);
    for block in values.chunks(QK) {
        let max_abs = block.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
        let scale = max_abs / 127.0;
        let inv = if scale > 0.0 { 1.0 / scale } else { 0.0 };
        out.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        for i in 0..QK {
            let v = block.get(i).copied().unwrap_or(0.0);
            out.push((v * inv).round().clamp(-128.0, 127.0) as i8 as u8);
        }
    }
    out
}

/// 4-bit quantization, 32 values per block. Byte `j` holds element `j` in
/// its low nibble and element `j + 16` in its high nibble, both offset by 8.
pub fn quantize_q4_0(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(QK) * Q4_0_BLOCK_BYTES);
    for block in values.chunks(QK) {
        let mut padded = [0.0f32; QK];
        padded[..block.len()].copy_from_slice(block);

        // Signed extreme so that it maps exactly onto -8.
        let extreme = padded
            .iter()
            .copied()
            .fold(0.0f32, |m, v| if v.abs() > m.abs() { v } else { m });
        let scale = extreme / -8.0;
        let inv = if scale != 0.0 { 1.0 / scale } else { 0.0 };
        out.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        for j in 0..QK / 2 {
            let lo = ((padded[j] * inv + 8.5) as i32).clamp(0, 15) as u8;
            let hi = ((padded[j + QK / 2] * inv + 8.5) as i32).clamp(0, 15) as u8;
            out.push(lo | (hi << 4));
        }
    }
    out
}

// -- Decoding ---------------------------------------------------------------

/// Unpack a Q4_0 block's 32 signed values into bytes for `dot_i8`.
#[inline]
fn unpack_q4_0(qs: &[u8]) -> [u8; QK] {
    let mut out = [0u8; QK];
    for j in 0..QK / 2 {
        out[j] = ((qs[j] & 0x0F) as i8 - 8) as u8;
        out[j + QK / 2] = ((qs[j] >> 4) as i8 - 8) as u8;
    }
    out
}

/// Decode `out.len()` values from an encoded row.
pub fn dequantize_row(ty: GgmlType, row: &[u8], out: &mut [f32]) {
    match ty {
        GgmlType::F32 => {
            for (o, c) in out.iter_mut().zip(row.chunks_exact(4)) {
                *o = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            }
        }
        GgmlType::F16 => {
            for (o, c) in out.iter_mut().zip(row.chunks_exact(2)) {
                *o = read_f16(c);
            }
        }
        GgmlType::Q8_0 => {
            for (dst, block) in out.chunks_mut(QK).zip(row.chunks_exact(Q8_0_BLOCK_BYTES)) {
                let d = read_f16(block);
                for (o, &q) in dst.iter_mut().zip(&block[2..]) {
                    *o = (q as i8) as f32 * d;
                }
            }
        }
        GgmlType::Q4_0 => {
            for (dst, block) in out.chunks_mut(QK).zip(row.chunks_exact(Q4_0_BLOCK_BYTES)) {
                let d = read_f16(block);
                let vals = unpack_q4_0(&block[2..]);
                for (o, &q) in dst.iter_mut().zip(vals.iter()) {
                    *o = (q as i8) as f32 * d;
                }
            }
        }
        other => unreachable!("{} rows are rejected at load", other),
    }
}

/// Dot product of one encoded weight row with `x`.
///
/// `scratch` must hold at least `x.len()` values; it is used to widen
/// F32/F16 rows before the vector kernel runs.
pub fn dot_row(family: AcceleratorFamily, ty: GgmlType, row: &[u8], x: &[f32], scratch: &mut [f32]) -> f32 {
    match ty {
        GgmlType::F32 | GgmlType::F16 => {
            let n = x.len();
            dequantize_row(ty, row, &mut scratch[..n]);
            simd_matmul::dot_f32(family, &scratch[..n], x)
        }
        GgmlType::Q8_0 => row
            .chunks_exact(Q8_0_BLOCK_BYTES)
            .zip(x.chunks(QK))
            .map(|(block, xs)| {
                let d = read_f16(block);
                d * simd_matmul::dot_i8(family, &block[2..2 + xs.len()], xs)
            })
            .sum(),
        GgmlType::Q4_0 => row
            .chunks_exact(Q4_0_BLOCK_BYTES)
            .zip(x.chunks(QK))
            .map(|(block, xs)| {
                let d = read_f16(block);
                let vals = unpack_q4_0(&block[2..]);
                d * simd_matmul::dot_i8(family, &vals[..xs.len()], xs)
            })
            .sum(),
        other => unreachable!("{} rows are rejected at load", other),
    }
}

/// Encoded byte length of a row of `cols` values.
pub fn row_bytes(ty: GgmlType, cols: usize) -> usize {
    cols / ty.block_size() * ty.block_bytes()
}
