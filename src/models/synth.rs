//! Tiny randomly initialised llama models.
//!
//! Small enough to load in milliseconds, large enough to exercise every
//! kernel: quantized matrices need widths that are multiples of 32. Used by
//! the `synth` CLI command, the benches and the tests.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::gguf::MetaValue;
use super::loader::ContainerError;
use super::tensors::{LayerTensor, OUTPUT, OUTPUT_NORM, TOKEN_EMBD};
use super::types::GgmlType;
use super::vocab::{
    sidecar_path, SpecialTokens, Vocabulary, KEY_ADD_BOS, KEY_BOS, KEY_EOS, KEY_PAD, KEY_SCORES, KEY_TOKENS,
    KEY_TOKEN_TYPE, KEY_UNK,
};
use super::writer::ContainerWriter;

const WORDS: &[&str] = &[
    "the", "a", "and", "to", "of", "in", "is", "it", "hello", "world", "on", "device", "model", "token",
    "once", "upon", "time", "there", "was", "small", "fast", "pocket",
];
const PAIRS: &[&str] = &["he", "ll", "lo", "th", "in", "er", "an", "on", "or", "ed"];

/// Shape and encoding of a synthetic model.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    pub name: String,
    pub n_layers: usize,
    pub hidden: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub ffn_hidden: usize,
    pub context_length: usize,
    /// Encoding of the projection and embedding matrices. Norms stay F32.
    pub weight_type: GgmlType,
    /// Omit `output.weight` so the LM head is tied to the embedding.
    pub tied_embeddings: bool,
    pub seed: u64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            name: "pocket-synth".to_string(),
            n_layers: 2,
            hidden: 64,
            n_heads: 4,
            n_kv_heads: 2,
            ffn_hidden: 128,
            context_length: 128,
            weight_type: GgmlType::Q8_0,
            tied_embeddings: false,
            seed: 0x5eed,
        }
    }
}

/// One tensor before encoding. `dims` are GGUF order (columns first).
#[derive(Debug, Clone, PartialEq)]
pub struct SynthTensor {
    pub name: String,
    pub dims: Vec<u64>,
    pub ty: GgmlType,
    pub values: Vec<f32>,
}

/// Vocabulary shared by every synthetic model: `<unk>`, `<s>`, `</s>`, the
/// 256 byte tokens, then letters, pairs and words with and without the
/// space marker. Longer pieces score higher so merges prefer them.
pub fn vocabulary() -> (Vec<String>, Vec<f32>, Vec<i32>) {
    let mut tokens = vec!["<unk>".to_string(), "<s>".to_string(), "</s>".to_string()];
    let mut types = vec![2, 3, 3];
    for b in 0..=255u8 {
        tokens.push(format!("<0x{:02X}>", b));
        types.push(6);
    }
    let mut pieces: Vec<String> = vec!["\u{2581}".to_string()];
    for c in 'a'..='z' {
        pieces.push(c.to_string());
        pieces.push(format!("\u{2581}{}", c));
    }
    for p in PAIRS {
        pieces.push(p.to_string());
    }
    for w in WORDS {
        pieces.push(format!("\u{2581}{}", w));
    }
    for p in ["\u{2581}he", "\u{2581}wor", "\u{2581}th", "orld", "ell", "ello"] {
        pieces.push(p.to_string());
    }
    for p in pieces {
        if !tokens.contains(&p) {
            tokens.push(p);
            types.push(1);
        }
    }
    let scores = tokens
        .iter()
        .zip(&types)
        .map(|(t, &ty)| if ty == 1 { t.chars().count() as f32 } else { 0.0 })
        .collect();
    (tokens, scores, types)
}

impl SynthConfig {
    pub fn vocab_size(&self) -> usize {
        vocabulary().0.len()
    }

    fn head_dim(&self) -> usize {
        self.hidden / self.n_heads
    }

    /// Every tensor of the model with seeded uniform weights.
    pub fn tensors(&self) -> Vec<SynthTensor> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let vocab = self.vocab_size();
        let kv_dim = self.head_dim() * self.n_kv_heads;
        let mut out = Vec::new();

        let matrix = |name: String, rows: usize, cols: usize, rng: &mut StdRng| {
            let scale = 1.0 / (cols as f32).sqrt();
            SynthTensor {
                name,
                dims: vec![cols as u64, rows as u64],
                ty: self.weight_type,
                values: (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0) * scale).collect(),
            }
        };
        let norm = |name: String| SynthTensor {
            name,
            dims: vec![self.hidden as u64],
            ty: GgmlType::F32,
            values: vec![1.0; self.hidden],
        };

        out.push(matrix(TOKEN_EMBD.to_string(), vocab, self.hidden, &mut rng));
        for layer in 0..self.n_layers {
            for role in LayerTensor::ALL {
                let name = role.primary_name(layer);
                let (rows, cols) = match role {
                    LayerTensor::AttnNorm | LayerTensor::FfnNorm => {
                        out.push(norm(name));
                        continue;
                    }
                    LayerTensor::AttnQ | LayerTensor::AttnOutput => (self.hidden, self.hidden),
                    LayerTensor::AttnK | LayerTensor::AttnV => (kv_dim, self.hidden),
                    LayerTensor::FfnGate | LayerTensor::FfnUp => (self.ffn_hidden, self.hidden),
                    LayerTensor::FfnDown => (self.hidden, self.ffn_hidden),
                };
                out.push(matrix(name, rows, cols, &mut rng));
            }
        }
        out.push(norm(OUTPUT_NORM.to_string()));
        if !self.tied_embeddings {
            out.push(matrix(OUTPUT.to_string(), vocab, self.hidden, &mut rng));
        }
        out
    }

    /// Container for `tensors`, which may have been edited after
    /// [`SynthConfig::tensors`].
    pub fn writer_with(&self, tensors: &[SynthTensor]) -> Result<ContainerWriter, ContainerError> {
        let (tokens, scores, types) = vocabulary();
        let arch = "llama";
        let key = |s: &str| format!("{}.{}", arch, s);
        let file_type = match self.weight_type {
            GgmlType::F32 => 0,
            GgmlType::F16 => 1,
            GgmlType::Q4_0 => 2,
            GgmlType::Q8_0 => 7,
            other => {
                return Err(ContainerError::UnsupportedQuantization {
                    tensor: "synthetic weights".into(),
                    ty: other,
                })
            }
        };

        let mut w = ContainerWriter::new();
        w.add_metadata("general.architecture", MetaValue::Str(arch.into()))
            .add_metadata("general.name", MetaValue::Str(self.name.clone()))
            .add_metadata("general.file_type", MetaValue::U32(file_type))
            .add_metadata(&key("block_count"), MetaValue::U32(self.n_layers as u32))
            .add_metadata(&key("embedding_length"), MetaValue::U32(self.hidden as u32))
            .add_metadata(&key("attention.head_count"), MetaValue::U32(self.n_heads as u32))
            .add_metadata(&key("attention.head_count_kv"), MetaValue::U32(self.n_kv_heads as u32))
            .add_metadata(&key("context_length"), MetaValue::U32(self.context_length as u32))
            .add_metadata(&key("feed_forward_length"), MetaValue::U32(self.ffn_hidden as u32))
            .add_metadata(&key("attention.layer_norm_rms_epsilon"), MetaValue::F32(1e-5))
            .add_metadata(&key("rope.freq_base"), MetaValue::F32(10_000.0))
            .add_metadata("tokenizer.ggml.model", MetaValue::Str("llama".into()))
            .add_metadata(KEY_TOKENS, MetaValue::Array(tokens.into_iter().map(MetaValue::Str).collect()))
            .add_metadata(KEY_SCORES, MetaValue::Array(scores.into_iter().map(MetaValue::F32).collect()))
            .add_metadata(KEY_TOKEN_TYPE, MetaValue::Array(types.into_iter().map(MetaValue::I32).collect()))
            .add_metadata(KEY_BOS, MetaValue::U32(1))
            .add_metadata(KEY_EOS, MetaValue::U32(2))
            .add_metadata(KEY_PAD, MetaValue::U32(0))
            .add_metadata(KEY_UNK, MetaValue::U32(0))
            .add_metadata(KEY_ADD_BOS, MetaValue::Bool(true));

        for t in tensors {
            w.add_tensor(&t.name, &t.dims, t.ty, &t.values)?;
        }
        Ok(w)
    }

    pub fn writer(&self) -> Result<ContainerWriter, ContainerError> {
        self.writer_with(&self.tensors())
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ContainerError> {
        self.writer()?.write_to(path)
    }

    /// Write the container without tokenizer tables and put them in a
    /// `.vocab` file beside it. Returns the vocabulary file's path.
    pub fn write_with_sidecar_vocab(&self, path: &Path) -> Result<PathBuf, ContainerError> {
        let mut w = self.writer()?;
        w.remove_metadata(KEY_TOKENS)
            .remove_metadata(KEY_SCORES)
            .remove_metadata(KEY_TOKEN_TYPE);
        w.write_to(path)?;

        let (tokens, scores, _) = vocabulary();
        let vocab = Vocabulary::new(tokens, scores, SpecialTokens::default())?;
        let sidecar = sidecar_path(path);
        std::fs::write(&sidecar, vocab.to_text())?;
        Ok(sidecar)
    }
}
