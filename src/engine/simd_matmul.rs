//! SIMD dot-product primitives behind the matmul kernels.
//!
//! Provides AVX2 (x86_64) and NEON (aarch64) implementations plus a scalar
//! reference. The family is chosen once when the kernel set is compiled and
//! passed in explicitly; a family is only ever selected after
//! [`AcceleratorFamily::is_supported`] confirmed it.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
use super::simd_neon;

use super::device::AcceleratorFamily;

/// Dot product of two f32 slices of equal length.
#[inline]
pub fn dot_f32(family: AcceleratorFamily, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match family {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: Avx2 is only selected when avx2+fma were detected
        AcceleratorFamily::Avx2 => unsafe { dot_f32_avx2(a, b) },
        #[cfg(target_arch = "aarch64")]
        // SAFETY: NEON is baseline on aarch64
        AcceleratorFamily::Neon => unsafe { simd_neon::dot_f32_neon(a, b) },
        _ => dot_f32_scalar(a, b),
    }
}

/// Dot product of signed 8-bit weights (stored as raw bytes) with f32 input.
/// The block scale is applied by the caller.
#[inline]
pub fn dot_i8(family: AcceleratorFamily, q: &[u8], x: &[f32]) -> f32 {
    debug_assert_eq!(q.len(), x.len());
    match family {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: Avx2 is only selected when avx2+fma were detected
        AcceleratorFamily::Avx2 => unsafe { dot_i8_avx2(q, x) },
        #[cfg(target_arch = "aarch64")]
        // SAFETY: NEON is baseline on aarch64
        AcceleratorFamily::Neon => unsafe { simd_neon::dot_i8_neon(q, x) },
        _ => dot_i8_scalar(q, x),
    }
}

// ============================================================================
// AVX2 Kernels (x86_64)
// ============================================================================

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let chunks = len / 8;
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        let offset = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(offset));
        let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    let sum = horizontal_sum_avx2(acc);
    let remainder: f32 = (chunks * 8..len).map(|i| a[i] * b[i]).sum();
    sum + remainder
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_i8_avx2(q: &[u8], x: &[f32]) -> f32 {
    let len = q.len().min(x.len());
    let chunks = len / 8;
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        let offset = i * 8;
        let q8 = _mm_loadl_epi64(q.as_ptr().add(offset) as *const __m128i);
        let q_vec = _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(q8));
        let in_vec = _mm256_loadu_ps(x.as_ptr().add(offset));
        acc = _mm256_fmadd_ps(q_vec, in_vec, acc);
    }

    let sum = horizontal_sum_avx2(acc);
    let remainder: f32 = (chunks * 8..len)
        .map(|i| (q[i] as i8 as f32) * x[i])
        .sum();
    sum + remainder
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn horizontal_sum_avx2(v: __m256) -> f32 {
    let hi = _mm256_extractf128_ps(v, 1);
    let lo = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(lo, hi);
    let hi64 = _mm_movehl_ps(sum128, sum128);
    let sum64 = _mm_add_ps(sum128, hi64);
    let hi32 = _mm_shuffle_ps(sum64, sum64, 1);
    _mm_cvtss_f32(_mm_add_ss(sum64, hi32))
}

// ============================================================================
// Scalar Reference
// ============================================================================

pub fn dot_f32_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

pub fn dot_i8_scalar(q: &[u8], x: &[f32]) -> f32 {
    q.iter().zip(x).map(|(&q, &v)| (q as i8 as f32) * v).sum()
}
