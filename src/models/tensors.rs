//! Tensor naming conventions.
//!
//! GGUF exports use `blk.N.*`; some converters keep the upstream
//! `model.layers.N.*` names. Both are accepted.

use super::gguf::{GgufFile, TensorInfo};

pub const TOKEN_EMBD: &str = "token_embd.weight";
pub const OUTPUT_NORM: &str = "output_norm.weight";
pub const OUTPUT: &str = "output.weight";

const TOKEN_EMBD_ALT: &str = "model.embed_tokens.weight";
const OUTPUT_NORM_ALT: &str = "model.norm.weight";
const OUTPUT_ALT: &str = "lm_head.weight";

/// Per-layer weight roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerTensor {
    AttnNorm,
    AttnQ,
    AttnK,
    AttnV,
    AttnOutput,
    FfnNorm,
    FfnGate,
    FfnUp,
    FfnDown,
}

impl LayerTensor {
    pub const ALL: [LayerTensor; 9] = [
        Self::AttnNorm,
        Self::AttnQ,
        Self::AttnK,
        Self::AttnV,
        Self::AttnOutput,
        Self::FfnNorm,
        Self::FfnGate,
        Self::FfnUp,
        Self::FfnDown,
    ];

    fn gguf_suffix(self) -> &'static str {
        match self {
            Self::AttnNorm => "attn_norm",
            Self::AttnQ => "attn_q",
            Self::AttnK => "attn_k",
            Self::AttnV => "attn_v",
            Self::AttnOutput => "attn_output",
            Self::FfnNorm => "ffn_norm",
            Self::FfnGate => "ffn_gate",
            Self::FfnUp => "ffn_up",
            Self::FfnDown => "ffn_down",
        }
    }

    fn upstream_suffix(self) -> &'static str {
        match self {
            Self::AttnNorm => "input_layernorm",
            Self::AttnQ => "self_attn.q_proj",
            Self::AttnK => "self_attn.k_proj",
            Self::AttnV => "self_attn.v_proj",
            Self::AttnOutput => "self_attn.o_proj",
            Self::FfnNorm => "post_attention_layernorm",
            Self::FfnGate => "mlp.gate_proj",
            Self::FfnUp => "mlp.up_proj",
            Self::FfnDown => "mlp.down_proj",
        }
    }

    pub fn primary_name(self, layer: usize) -> String {
        format!("blk.{}.{}.weight", layer, self.gguf_suffix())
    }

    pub fn upstream_name(self, layer: usize) -> String {
        format!("model.layers.{}.{}.weight", layer, self.upstream_suffix())
    }

    pub fn is_norm(self) -> bool {
        matches!(self, Self::AttnNorm | Self::FfnNorm)
    }

    /// Find the tensor under either naming scheme.
    pub fn find(self, file: &GgufFile, layer: usize) -> Option<&TensorInfo> {
        file.tensor(&self.primary_name(layer))
            .or_else(|| file.tensor(&self.upstream_name(layer)))
    }
}

pub fn find_token_embd(file: &GgufFile) -> Option<&TensorInfo> {
    file.tensor(TOKEN_EMBD).or_else(|| file.tensor(TOKEN_EMBD_ALT))
}

pub fn find_output_norm(file: &GgufFile) -> Option<&TensorInfo> {
    file.tensor(OUTPUT_NORM).or_else(|| file.tensor(OUTPUT_NORM_ALT))
}

/// LM head; absent when tied to the token embedding.
pub fn find_output(file: &GgufFile) -> Option<&TensorInfo> {
    file.tensor(OUTPUT).or_else(|| file.tensor(OUTPUT_ALT))
}
