//! NEON SIMD kernels for aarch64.
//!
//! f32 and signed 8-bit dot products for ARM devices.

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

// ============================================================================
// NEON Kernels (aarch64)
// ============================================================================

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
pub unsafe fn dot_f32_neon(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let chunks = len / 4;
    let mut acc = vdupq_n_f32(0.0);

    for i in 0..chunks {
        let offset = i * 4;
        let va = vld1q_f32(a.as_ptr().add(offset));
        let vb = vld1q_f32(b.as_ptr().add(offset));
        acc = vfmaq_f32(acc, va, vb);
    }

    let sum = horizontal_sum_neon(acc);
    let remainder: f32 = (chunks * 4..len).map(|i| a[i] * b[i]).sum();
    sum + remainder
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
pub unsafe fn dot_i8_neon(q: &[u8], x: &[f32]) -> f32 {
    let len = q.len().min(x.len());
    let chunks = len / 8;
    let mut acc = vdupq_n_f32(0.0);

    for i in 0..chunks {
        let offset = i * 8;
        let q16 = vmovl_s8(vld1_s8(q.as_ptr().add(offset) as *const i8));
        let lo = vcvtq_f32_s32(vmovl_s16(vget_low_s16(q16)));
        let hi = vcvtq_f32_s32(vmovl_s16(vget_high_s16(q16)));
        acc = vfmaq_f32(acc, lo, vld1q_f32(x.as_ptr().add(offset)));
        acc = vfmaq_f32(acc, hi, vld1q_f32(x.as_ptr().add(offset + 4)));
    }

    let sum = horizontal_sum_neon(acc);
    let remainder: f32 = (chunks * 8..len)
        .map(|i| (q[i] as i8 as f32) * x[i])
        .sum();
    sum + remainder
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn horizontal_sum_neon(v: float32x4_t) -> f32 {
    let sum2 = vpadd_f32(vget_low_f32(v), vget_high_f32(v));
    let sum1 = vpadd_f32(sum2, sum2);
    vget_lane_f32(sum1, 0)
}
