//! GGUF v3 writer.
//!
//! Produces containers the parser accepts: used by the `synth` CLI command,
//! the benches and the integration tests.

use std::io::Write;
use std::path::Path;

use super::gguf::{align_up, MetaValue, DEFAULT_ALIGNMENT, GGUF_MAGIC};
use super::loader::ContainerError;
use super::types::GgmlType;
use crate::engine::quantize;

struct PendingTensor {
    name: String,
    dims: Vec<u64>,
    ty: GgmlType,
    data: Vec<u8>,
}

/// Incremental builder for a GGUF file.
#[derive(Default)]
pub struct ContainerWriter {
    metadata: Vec<(String, MetaValue)>,
    tensors: Vec<PendingTensor>,
}

impl ContainerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_metadata(&mut self, key: &str, value: MetaValue) -> &mut Self {
        self.metadata.push((key.to_string(), value));
        self
    }

    /// Drop every entry for `key`.
    pub fn remove_metadata(&mut self, key: &str) -> &mut Self {
        self.metadata.retain(|(k, _)| k != key);
        self
    }

    /// Add a tensor whose payload is already encoded as `ty`.
    pub fn add_tensor_raw(&mut self, name: &str, dims: &[u64], ty: GgmlType, data: Vec<u8>) -> &mut Self {
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            dims: dims.to_vec(),
            ty,
            data,
        });
        self
    }

    pub fn add_tensor_f32(&mut self, name: &str, dims: &[u64], values: &[f32]) -> &mut Self {
        self.add_tensor_raw(name, dims, GgmlType::F32, quantize::encode_f32(values))
    }

    /// Encode `values` as `ty` and add the tensor.
    pub fn add_tensor(
        &mut self,
        name: &str,
        dims: &[u64],
        ty: GgmlType,
        values: &[f32],
    ) -> Result<&mut Self, ContainerError> {
        let data = match ty {
            GgmlType::F32 => quantize::encode_f32(values),
            GgmlType::F16 => quantize::encode_f16(values),
            GgmlType::Q8_0 => quantize::quantize_q8_0(values),
            GgmlType::Q4_0 => quantize::quantize_q4_0(values),
            other => {
                return Err(ContainerError::UnsupportedQuantization {
                    tensor: name.to_string(),
                    ty: other,
                })
            }
        };
        Ok(self.add_tensor_raw(name, dims, ty, data))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&GGUF_MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, value) in &self.metadata {
            write_string(&mut out, key);
            out.extend_from_slice(&value.type_tag().to_le_bytes());
            write_value(&mut out, value);
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offset = align_up(offset, DEFAULT_ALIGNMENT);
            offsets.push(offset);
            write_string(&mut out, &t.name);
            out.extend_from_slice(&(t.dims.len() as u32).to_le_bytes());
            for d in &t.dims {
                out.extend_from_slice(&d.to_le_bytes());
            }
            out.extend_from_slice(&t.ty.id().to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            offset += t.data.len() as u64;
        }

        let data_start = align_up(out.len() as u64, DEFAULT_ALIGNMENT) as usize;
        out.resize(data_start, 0);
        for (t, off) in self.tensors.iter().zip(offsets) {
            out.resize(data_start + off as usize, 0);
            out.extend_from_slice(&t.data);
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ContainerError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_value(out: &mut Vec<u8>, value: &MetaValue) {
    match value {
        MetaValue::U8(v) => out.push(*v),
        MetaValue::I8(v) => out.push(*v as u8),
        MetaValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetaValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetaValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetaValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetaValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetaValue::Bool(v) => out.push(*v as u8),
        MetaValue::Str(s) => write_string(out, s),
        MetaValue::Array(items) => {
            let elem_tag = items.first().map(MetaValue::type_tag).unwrap_or(0);
            out.extend_from_slice(&elem_tag.to_le_bytes());
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(out, item);
            }
        }
        MetaValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetaValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetaValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
    }
}
