//! Versioned kernel templates.
//!
//! A template names a logical operation and the variants it can be
//! specialised into. Bumping [`KERNEL_SOURCE_VERSION`] changes every cache
//! key and forces recompilation on all devices.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::device::AcceleratorFamily;
use crate::models::GgmlType;

/// Version of the kernel sources; part of the cache key.
pub const KERNEL_SOURCE_VERSION: &str = "pocket-kernels-3";

/// Logical operations the execution graph dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Embedding,
    MatmulF32,
    MatmulF16,
    MatmulQ8_0,
    MatmulQ4_0,
    RmsNorm,
    Rope,
    Attention,
    Softmax,
    SiluMul,
    ResidualAdd,
}

impl OpKind {
    pub const ALL: [OpKind; 11] = [
        Self::Embedding,
        Self::MatmulF32,
        Self::MatmulF16,
        Self::MatmulQ8_0,
        Self::MatmulQ4_0,
        Self::RmsNorm,
        Self::Rope,
        Self::Attention,
        Self::Softmax,
        Self::SiluMul,
        Self::ResidualAdd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::MatmulF32 => "matmul-f32",
            Self::MatmulF16 => "matmul-f16",
            Self::MatmulQ8_0 => "matmul-q8_0",
            Self::MatmulQ4_0 => "matmul-q4_0",
            Self::RmsNorm => "rmsnorm",
            Self::Rope => "rope",
            Self::Attention => "attention",
            Self::Softmax => "softmax",
            Self::SiluMul => "silu-mul",
            Self::ResidualAdd => "residual-add",
        }
    }

    /// Matmul op for a weight encoding.
    pub fn matmul_for(ty: GgmlType) -> Option<Self> {
        match ty {
            GgmlType::F32 => Some(Self::MatmulF32),
            GgmlType::F16 => Some(Self::MatmulF16),
            GgmlType::Q8_0 => Some(Self::MatmulQ8_0),
            GgmlType::Q4_0 => Some(Self::MatmulQ4_0),
            _ => None,
        }
    }

    pub fn weight_type(self) -> Option<GgmlType> {
        match self {
            Self::MatmulF32 => Some(GgmlType::F32),
            Self::MatmulF16 => Some(GgmlType::F16),
            Self::MatmulQ8_0 => Some(GgmlType::Q8_0),
            Self::MatmulQ4_0 => Some(GgmlType::Q4_0),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Code path a compiled kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    /// Vectorised with the device family's SIMD primitives.
    Vector(AcceleratorFamily),
    /// Portable scalar loop.
    Scalar,
}

impl Variant {
    pub fn family(self) -> AcceleratorFamily {
        match self {
            Self::Vector(f) => f,
            Self::Scalar => AcceleratorFamily::Scalar,
        }
    }
}

/// Source description of one operation.
#[derive(Debug, Clone)]
pub struct KernelTemplate {
    pub op: OpKind,
    /// Template revision, folded into the artifact.
    pub revision: u32,
    /// Whether the op has SIMD variants.
    pub vectorised: bool,
    /// Whether the op's work is tiled and takes a tile size.
    pub tiled: bool,
}

impl KernelTemplate {
    /// Variants in preference order for a device family.
    pub fn variants(&self, family: AcceleratorFamily) -> Vec<Variant> {
        if self.vectorised && family != AcceleratorFamily::Scalar {
            vec![Variant::Vector(family), Variant::Scalar]
        } else {
            vec![Variant::Scalar]
        }
    }
}

/// The built-in template table.
pub fn builtin_templates() -> Vec<KernelTemplate> {
    OpKind::ALL
        .iter()
        .map(|&op| {
            let (vectorised, tiled) = match op {
                OpKind::MatmulF32 | OpKind::MatmulF16 | OpKind::MatmulQ8_0 | OpKind::MatmulQ4_0 => {
                    (true, true)
                }
                OpKind::Attention => (true, true),
                OpKind::RmsNorm => (true, false),
                _ => (false, false),
            };
            KernelTemplate {
                op,
                revision: 1,
                vectorised,
                tiled,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_op_has_a_template() {
        let templates = builtin_templates();
        assert_eq!(templates.len(), OpKind::ALL.len());
        for op in OpKind::ALL {
            assert!(templates.iter().any(|t| t.op == op));
        }
    }

    #[test]
    fn scalar_devices_get_only_scalar_variants() {
        let t = builtin_templates().remove(1);
        assert_eq!(t.variants(AcceleratorFamily::Scalar), vec![Variant::Scalar]);
        assert_eq!(
            t.variants(AcceleratorFamily::Avx2),
            vec![Variant::Vector(AcceleratorFamily::Avx2), Variant::Scalar]
        );
    }

    #[test]
    fn matmul_ops_map_to_weight_types() {
        for ty in [GgmlType::F32, GgmlType::F16, GgmlType::Q8_0, GgmlType::Q4_0] {
            assert_eq!(OpKind::matmul_for(ty).unwrap().weight_type(), Some(ty));
        }
        assert!(OpKind::matmul_for(GgmlType::Q4K).is_none());
    }
}
