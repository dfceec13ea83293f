//! GGUF container parsing.
//!
//! Reads the header, metadata table and tensor descriptor table from a
//! mapped file. Tensor payloads are never copied: descriptors carry absolute
//! byte ranges into the mapping and every range is checked against the file
//! length before the container is handed out.

use std::collections::HashMap;

use super::loader::ContainerError;
use super::types::GgmlType;

/// "GGUF" as it appears on disk.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
pub const MIN_VERSION: u32 = 2;
pub const MAX_VERSION: u32 = 3;
pub const DEFAULT_ALIGNMENT: u64 = 32;
pub const MAX_DIMS: usize = 4;

// Guards against absurd counts in corrupted headers before we allocate.
const MAX_TENSORS: u64 = 1 << 20;
const MAX_METADATA: u64 = 1 << 20;
const MAX_STRING_LEN: u64 = 1 << 24;

/// Metadata value type tags.
mod tag {
    pub const U8: u32 = 0;
    pub const I8: u32 = 1;
    pub const U16: u32 = 2;
    pub const I16: u32 = 3;
    pub const U32: u32 = 4;
    pub const I32: u32 = 5;
    pub const F32: u32 = 6;
    pub const BOOL: u32 = 7;
    pub const STRING: u32 = 8;
    pub const ARRAY: u32 = 9;
    pub const U64: u32 = 10;
    pub const I64: u32 = 11;
    pub const F64: u32 = 12;
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    Str(String),
    Array(Vec<MetaValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetaValue {
    pub fn type_tag(&self) -> u32 {
        match self {
            Self::U8(_) => tag::U8,
            Self::I8(_) => tag::I8,
            Self::U16(_) => tag::U16,
            Self::I16(_) => tag::I16,
            Self::U32(_) => tag::U32,
            Self::I32(_) => tag::I32,
            Self::F32(_) => tag::F32,
            Self::Bool(_) => tag::BOOL,
            Self::Str(_) => tag::STRING,
            Self::Array(_) => tag::ARRAY,
            Self::U64(_) => tag::U64,
            Self::I64(_) => tag::I64,
            Self::F64(_) => tag::F64,
        }
    }

    /// Non-negative integer view of any integer variant.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            Self::I8(v) if v >= 0 => Some(v as u64),
            Self::I16(v) if v >= 0 => Some(v as u64),
            Self::I32(v) if v >= 0 => Some(v as u64),
            Self::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            Self::F64(v) => Some(v as f32),
            _ => self.as_u64().map(|v| v as f32),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetaValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Descriptor for one tensor in the container.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    /// GGML order: `dims[0]` is the contiguous (innermost) dimension.
    pub dims: Vec<u64>,
    pub ty: GgmlType,
    /// Offset relative to the start of the data section.
    pub offset: u64,
    /// Absolute byte offset in the file.
    pub start: u64,
    pub byte_len: u64,
}

impl TensorInfo {
    pub fn n_elements(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Row length for a matrix (innermost dimension).
    pub fn cols(&self) -> usize {
        self.dims.first().copied().unwrap_or(1) as usize
    }

    /// Number of rows (product of outer dimensions).
    pub fn rows(&self) -> usize {
        self.dims.iter().skip(1).product::<u64>() as usize
    }

    pub fn end(&self) -> u64 {
        self.start + self.byte_len
    }
}

/// Parsed GGUF header, metadata and tensor table.
#[derive(Debug, Clone)]
pub struct GgufFile {
    pub version: u32,
    pub alignment: u64,
    pub data_offset: u64,
    metadata: Vec<(String, MetaValue)>,
    metadata_index: HashMap<String, usize>,
    tensors: Vec<TensorInfo>,
    tensor_index: HashMap<String, usize>,
}

impl GgufFile {
    /// Parse a complete container image.
    pub fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        let mut r = Reader::new(bytes);

        let magic = r.take(4, "magic")?;
        if magic != GGUF_MAGIC {
            return Err(ContainerError::Format(format!(
                "bad magic {:02x?}, expected \"GGUF\"",
                magic
            )));
        }
        let version = r.u32("version")?;
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(ContainerError::Format(format!(
                "unsupported GGUF version {} (supported {}..={})",
                version, MIN_VERSION, MAX_VERSION
            )));
        }

        let tensor_count = r.u64("tensor count")?;
        let kv_count = r.u64("metadata count")?;
        if tensor_count > MAX_TENSORS || kv_count > MAX_METADATA {
            return Err(ContainerError::Format(format!(
                "implausible table sizes: {} tensors, {} metadata entries",
                tensor_count, kv_count
            )));
        }

        let mut metadata = Vec::with_capacity(kv_count as usize);
        let mut metadata_index = HashMap::with_capacity(kv_count as usize);
        for _ in 0..kv_count {
            let key = r.string("metadata key")?;
            let ty = r.u32("metadata type")?;
            let value = r.value(ty, &key, true)?;
            metadata_index.insert(key.clone(), metadata.len());
            metadata.push((key, value));
        }

        let alignment = match metadata_index.get("general.alignment") {
            Some(&i) => metadata[i].1.as_u64().filter(|a| a.is_power_of_two()).ok_or_else(|| {
                ContainerError::Format("general.alignment must be a power of two".into())
            })?,
            None => DEFAULT_ALIGNMENT,
        };

        let mut raw = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            raw.push(r.tensor_header()?);
        }

        let data_offset = align_up(r.pos as u64, alignment);
        let file_len = bytes.len() as u64;

        let mut tensors = Vec::with_capacity(raw.len());
        let mut tensor_index = HashMap::with_capacity(raw.len());
        for (name, dims, ty_id, offset) in raw {
            let ty = GgmlType::from_id(ty_id).ok_or_else(|| {
                ContainerError::Format(format!("tensor '{}' has unknown type id {}", name, ty_id))
            })?;
            let elements = dims
                .iter()
                .try_fold(1u64, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| ContainerError::Format(format!("tensor '{}' is too large", name)))?;
            if elements % ty.block_size() as u64 != 0 {
                return Err(ContainerError::Format(format!(
                    "tensor '{}' has {} elements, not a multiple of the {} block size",
                    name, elements, ty
                )));
            }
            let byte_len = ty
                .byte_len(elements)
                .ok_or_else(|| ContainerError::Format(format!("tensor '{}' is too large", name)))?;
            let start = data_offset
                .checked_add(offset)
                .ok_or_else(|| ContainerError::Format(format!("tensor '{}' offset overflow", name)))?;
            let end = start
                .checked_add(byte_len)
                .ok_or_else(|| ContainerError::Format(format!("tensor '{}' offset overflow", name)))?;
            if end > file_len {
                return Err(ContainerError::Truncated {
                    what: format!("tensor '{}'", name),
                    start,
                    end,
                    file_len,
                });
            }
            if tensor_index.insert(name.clone(), tensors.len()).is_some() {
                return Err(ContainerError::Format(format!("duplicate tensor '{}'", name)));
            }
            tensors.push(TensorInfo {
                name,
                dims,
                ty,
                offset,
                start,
                byte_len,
            });
        }

        Ok(Self {
            version,
            alignment,
            data_offset,
            metadata,
            metadata_index,
            tensors,
            tensor_index,
        })
    }

    pub fn metadata(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.metadata.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.metadata_index.get(key).map(|&i| &self.metadata[i].1)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(MetaValue::as_u64)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(MetaValue::as_f32)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(MetaValue::as_bool)
    }

    /// Required integer key.
    pub fn require_u64(&self, key: &str) -> Result<u64, ContainerError> {
        self.get_u64(key)
            .ok_or_else(|| ContainerError::MissingMetadata(key.to_string()))
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensor_index.get(name).map(|&i| &self.tensors[i])
    }

    pub fn metadata_len(&self) -> usize {
        self.metadata.len()
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    let rem = value % alignment;
    if rem == 0 {
        value
    } else {
        value + (alignment - rem)
    }
}

// -- Cursor ------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ContainerError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let out = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(ContainerError::Truncated {
                what: what.to_string(),
                start: self.pos as u64,
                end: self.pos as u64 + n as u64,
                file_len: self.bytes.len() as u64,
            }),
        }
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], ContainerError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u32(&mut self, what: &str) -> Result<u32, ContainerError> {
        Ok(u32::from_le_bytes(self.array(what)?))
    }

    fn u64(&mut self, what: &str) -> Result<u64, ContainerError> {
        Ok(u64::from_le_bytes(self.array(what)?))
    }

    fn string(&mut self, what: &str) -> Result<String, ContainerError> {
        let len = self.u64(what)?;
        if len > MAX_STRING_LEN {
            return Err(ContainerError::Format(format!(
                "{} length {} exceeds limit",
                what, len
            )));
        }
        let raw = self.take(len as usize, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ContainerError::Format(format!("{} is not valid UTF-8", what)))
    }

    fn value(&mut self, ty: u32, key: &str, allow_array: bool) -> Result<MetaValue, ContainerError> {
        Ok(match ty {
            tag::U8 => MetaValue::U8(self.array::<1>(key)?[0]),
            tag::I8 => MetaValue::I8(self.array::<1>(key)?[0] as i8),
            tag::U16 => MetaValue::U16(u16::from_le_bytes(self.array(key)?)),
            tag::I16 => MetaValue::I16(i16::from_le_bytes(self.array(key)?)),
            tag::U32 => MetaValue::U32(self.u32(key)?),
            tag::I32 => MetaValue::I32(i32::from_le_bytes(self.array(key)?)),
            tag::F32 => MetaValue::F32(f32::from_le_bytes(self.array(key)?)),
            tag::BOOL => match self.array::<1>(key)?[0] {
                0 => MetaValue::Bool(false),
                1 => MetaValue::Bool(true),
                b => {
                    return Err(ContainerError::Format(format!(
                        "metadata '{}' has invalid bool byte {}",
                        key, b
                    )))
                }
            },
            tag::STRING => MetaValue::Str(self.string(key)?),
            tag::ARRAY if allow_array => {
                let elem_ty = self.u32(key)?;
                let len = self.u64(key)?;
                // Each element needs at least one byte; reject counts the file cannot hold.
                if len > (self.bytes.len() - self.pos) as u64 {
                    return Err(ContainerError::Truncated {
                        what: format!("metadata array '{}'", key),
                        start: self.pos as u64,
                        end: self.pos as u64 + len,
                        file_len: self.bytes.len() as u64,
                    });
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(self.value(elem_ty, key, false)?);
                }
                MetaValue::Array(items)
            }
            tag::ARRAY => {
                return Err(ContainerError::Format(format!(
                    "metadata '{}' contains a nested array",
                    key
                )))
            }
            tag::U64 => MetaValue::U64(self.u64(key)?),
            tag::I64 => MetaValue::I64(i64::from_le_bytes(self.array(key)?)),
            tag::F64 => MetaValue::F64(f64::from_le_bytes(self.array(key)?)),
            other => {
                return Err(ContainerError::Format(format!(
                    "metadata '{}' has unknown value type {}",
                    key, other
                )))
            }
        })
    }

    fn tensor_header(&mut self) -> Result<(String, Vec<u64>, u32, u64), ContainerError> {
        let name = self.string("tensor name")?;
        let n_dims = self.u32("tensor rank")? as usize;
        if n_dims == 0 || n_dims > MAX_DIMS {
            return Err(ContainerError::Format(format!(
                "tensor '{}' has rank {} (expected 1..={})",
                name, n_dims, MAX_DIMS
            )));
        }
        let mut dims = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            dims.push(self.u64("tensor dimension")?);
        }
        let ty = self.u32("tensor type")?;
        let offset = self.u64("tensor offset")?;
        Ok((name, dims, ty, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::writer::ContainerWriter;

    fn sample() -> Vec<u8> {
        let mut w = ContainerWriter::new();
        w.add_metadata("general.architecture", MetaValue::Str("llama".into()));
        w.add_metadata("llama.block_count", MetaValue::U32(2));
        w.add_metadata(
            "tokenizer.ggml.scores",
            MetaValue::Array(vec![MetaValue::F32(0.5), MetaValue::F32(-1.0)]),
        );
        w.add_tensor_f32("a", &[4, 2], &[0.0; 8]);
        w.add_tensor_f32("b", &[3], &[1.0, 2.0, 3.0]);
        w.to_bytes()
    }

    #[test]
    fn parses_metadata_and_tensors() {
        let bytes = sample();
        let file = GgufFile::parse(&bytes).unwrap();
        assert_eq!(file.version, 3);
        assert_eq!(file.get_str("general.architecture"), Some("llama"));
        assert_eq!(file.get_u64("llama.block_count"), Some(2));
        assert_eq!(file.get("tokenizer.ggml.scores").unwrap().as_array().unwrap().len(), 2);

        let a = file.tensor("a").unwrap();
        assert_eq!(a.cols(), 4);
        assert_eq!(a.rows(), 2);
        assert_eq!(a.byte_len, 32);
        assert_eq!(a.start % DEFAULT_ALIGNMENT, 0);
        let b = file.tensor("b").unwrap();
        assert!(b.start >= a.end());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample();
        bytes[0] = b'X';
        assert!(matches!(GgufFile::parse(&bytes), Err(ContainerError::Format(_))));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = sample();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(GgufFile::parse(&bytes), Err(ContainerError::Format(_))));
    }

    #[test]
    fn truncated_tensor_data_is_detected() {
        let bytes = sample();
        let cut = &bytes[..bytes.len() - 4];
        assert!(matches!(
            GgufFile::parse(cut),
            Err(ContainerError::Truncated { .. })
        ));
    }

    #[test]
    fn truncated_header_is_detected() {
        let bytes = sample();
        assert!(matches!(
            GgufFile::parse(&bytes[..10]),
            Err(ContainerError::Truncated { .. })
        ));
    }

    #[test]
    fn align_up_behaves() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(64, 32), 64);
    }
}
