//! GGML tensor element types and their block geometry.

use std::fmt;

use serde::{Serialize, Serializer};

/// Tensor element encodings that may appear in a GGUF container.
///
/// Only [`GgmlType::is_executable`] types can be run by the kernels; the
/// rest are recognised so load can fail with a precise diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    I8,
    I16,
    I32,
}

/// Elements per Q4_0 / Q8_0 block.
pub const QK: usize = 32;
/// Bytes per Q8_0 block: f16 scale followed by 32 signed bytes.
pub const Q8_0_BLOCK_BYTES: usize = 2 + QK;
/// Bytes per Q4_0 block: f16 scale followed by 16 packed nibble pairs.
pub const Q4_0_BLOCK_BYTES: usize = 2 + QK / 2;

impl GgmlType {
    /// Decode the on-disk type id. Returns `None` for ids this build does not know.
    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2K,
            11 => Self::Q3K,
            12 => Self::Q4K,
            13 => Self::Q5K,
            14 => Self::Q6K,
            24 => Self::I8,
            25 => Self::I16,
            26 => Self::I32,
            _ => return None,
        })
    }

    pub fn id(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q8_1 => 9,
            Self::Q2K => 10,
            Self::Q3K => 11,
            Self::Q4K => 12,
            Self::Q5K => 13,
            Self::Q6K => 14,
            Self::I8 => 24,
            Self::I16 => 25,
            Self::I32 => 26,
        }
    }

    /// Number of elements encoded by one block.
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::I8 | Self::I16 | Self::I32 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 => QK,
            Self::Q2K | Self::Q3K | Self::Q4K | Self::Q5K | Self::Q6K => 256,
        }
    }

    /// Bytes occupied by one block.
    pub fn block_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => Q4_0_BLOCK_BYTES,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => Q8_0_BLOCK_BYTES,
            Self::Q8_1 => 40,
            Self::Q2K => 84,
            Self::Q3K => 110,
            Self::Q4K => 144,
            Self::Q5K => 176,
            Self::Q6K => 210,
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
        }
    }

    /// Byte length of `elements` values, or `None` on overflow.
    pub fn byte_len(self, elements: u64) -> Option<u64> {
        let block = self.block_size() as u64;
        let blocks = elements.checked_add(block - 1)? / block;
        blocks.checked_mul(self.block_bytes() as u64)
    }

    /// Whether the kernel set can consume this encoding directly.
    pub fn is_executable(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::Q8_0 | Self::Q4_0)
    }

    pub fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// Map `general.file_type` to the weight encoding it declares.
    pub fn from_file_type(file_type: u32) -> Option<Self> {
        Some(match file_type {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            7 => Self::Q8_0,
            8 => Self::Q5_0,
            9 => Self::Q5_1,
            10 => Self::Q2K,
            11..=13 => Self::Q3K,
            14 | 15 => Self::Q4K,
            16 | 17 => Self::Q5K,
            18 => Self::Q6K,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Q8_0 => "q8_0",
            Self::Q8_1 => "q8_1",
            Self::Q2K => "q2_k",
            Self::Q3K => "q3_k",
            Self::Q4K => "q4_k",
            Self::Q5K => "q5_k",
            Self::Q6K => "q6_k",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
        }
    }
}

impl fmt::Display for GgmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for GgmlType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for id in [0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 12, 13, 14, 24, 25, 26] {
            let ty = GgmlType::from_id(id).unwrap();
            assert_eq!(ty.id(), id);
        }
        assert!(GgmlType::from_id(4).is_none());
        assert!(GgmlType::from_id(99).is_none());
    }

    #[test]
    fn byte_len_rounds_up_to_whole_blocks() {
        assert_eq!(GgmlType::F32.byte_len(10), Some(40));
        assert_eq!(GgmlType::Q8_0.byte_len(64), Some(68));
        assert_eq!(GgmlType::Q4_0.byte_len(33), Some(36));
        assert_eq!(GgmlType::Q6K.byte_len(256), Some(210));
    }

    #[test]
    fn byte_len_detects_overflow() {
        assert_eq!(GgmlType::F32.byte_len(u64::MAX / 2), None);
    }

    #[test]
    fn only_dense_and_block8_types_execute() {
        assert!(GgmlType::Q4_0.is_executable());
        assert!(GgmlType::Q8_0.is_executable());
        assert!(!GgmlType::Q4K.is_executable());
        assert!(!GgmlType::I8.is_executable());
    }
}
