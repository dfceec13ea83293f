//! Architecture hyperparameters read from container metadata.

use serde::Serialize;

use super::gguf::GgufFile;
use crate::config::MAX_CONTEXT_LIMIT;
use super::loader::ContainerError;
use super::tensors::{LayerTensor, TOKEN_EMBD};
use super::types::GgmlType;

pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;
pub const DEFAULT_RMS_EPS: f32 = 1e-5;
pub const DEFAULT_ROPE_BASE: f32 = 10_000.0;

/// Decoder hyperparameters for a llama-family model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHparams {
    pub architecture: String,
    pub n_layers: usize,
    pub hidden: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub context_length: usize,
    pub ffn_hidden: usize,
    pub rms_eps: f32,
    pub rope_base: f32,
    pub vocab_size: usize,
    /// Declared or dominant weight encoding.
    pub quantization: GgmlType,
}

impl ModelHparams {
    pub fn from_gguf(file: &GgufFile, vocab_size: usize) -> Result<Self, ContainerError> {
        let arch = file
            .get_str("general.architecture")
            .unwrap_or("llama")
            .to_string();
        let key = |suffix: &str| format!("{}.{}", arch, suffix);

        let n_layers = file.require_u64(&key("block_count"))? as usize;
        let hidden = file.require_u64(&key("embedding_length"))? as usize;
        let n_heads = file.require_u64(&key("attention.head_count"))? as usize;
        let n_kv_heads = file
            .get_u64(&key("attention.head_count_kv"))
            .map(|v| v as usize)
            .unwrap_or(n_heads);
        let context_length = file
            .get_u64(&key("context_length"))
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);
        let ffn_hidden = match file.get_u64(&key("feed_forward_length")) {
            Some(v) => v as usize,
            None => file
                .tensor(&LayerTensor::FfnGate.primary_name(0))
                .map(|t| t.rows())
                .ok_or_else(|| ContainerError::MissingMetadata(key("feed_forward_length")))?,
        };
        let rms_eps = file
            .get_f32(&key("attention.layer_norm_rms_epsilon"))
            .unwrap_or(DEFAULT_RMS_EPS);
        let rope_base = file
            .get_f32(&key("rope.freq_base"))
            .unwrap_or(DEFAULT_ROPE_BASE);

        let quantization = file
            .get_u64("general.file_type")
            .and_then(|ft| GgmlType::from_file_type(ft as u32))
            .unwrap_or_else(|| dominant_type(file));

        let hp = Self {
            architecture: arch,
            n_layers,
            hidden,
            n_heads,
            n_kv_heads,
            context_length,
            ffn_hidden,
            rms_eps,
            rope_base,
            vocab_size,
            quantization,
        };
        hp.validate()?;
        Ok(hp)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden / self.n_heads
    }

    /// Width of the key/value projections.
    pub fn kv_dim(&self) -> usize {
        self.head_dim() * self.n_kv_heads
    }

    fn validate(&self) -> Result<(), ContainerError> {
        let fail = |msg: String| Err(ContainerError::Format(msg));
        if self.n_layers == 0 || self.hidden == 0 || self.n_heads == 0 || self.n_kv_heads == 0 {
            return fail(format!("degenerate hyperparameters: {:?}", self));
        }
        if self.ffn_hidden == 0 || self.context_length == 0 || self.vocab_size == 0 {
            return fail(format!("degenerate hyperparameters: {:?}", self));
        }
        if self.context_length > MAX_CONTEXT_LIMIT {
            return fail(format!(
                "context length {} exceeds the supported maximum of {}",
                self.context_length, MAX_CONTEXT_LIMIT
            ));
        }
        if self.hidden % self.n_heads != 0 {
            return fail(format!(
                "embedding length {} not divisible by {} heads",
                self.hidden, self.n_heads
            ));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return fail(format!(
                "{} heads not divisible by {} key/value heads",
                self.n_heads, self.n_kv_heads
            ));
        }
        if self.head_dim() % 2 != 0 {
            return fail(format!("head dimension {} must be even for RoPE", self.head_dim()));
        }
        if !(self.rms_eps > 0.0 && self.rms_eps.is_finite()) || !(self.rope_base > 0.0) {
            return fail("rms epsilon and rope base must be positive".into());
        }
        Ok(())
    }
}

/// Encoding holding the most weight elements, embeddings excluded.
fn dominant_type(file: &GgufFile) -> GgmlType {
    let mut totals: std::collections::BTreeMap<GgmlType, u64> = Default::default();
    for t in file.tensors() {
        if t.dims.len() >= 2 && t.name != TOKEN_EMBD {
            *totals.entry(t.ty).or_default() += t.n_elements();
        }
    }
    totals
        .into_iter()
        .max_by_key(|&(_, n)| n)
        .map(|(ty, _)| ty)
        .unwrap_or(GgmlType::F32)
}
