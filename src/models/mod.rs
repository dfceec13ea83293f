//! Model container: GGUF parsing, hyperparameters and vocabulary.
//!
//! [`ModelContainer::open`] maps the file, parses every table and checks
//! that each tensor uses an encoding the kernels can execute. Models without
//! embedded tokenizer tables read them from a `.vocab` file alongside. The result is
//! immutable and owned by the engine that loaded it.

pub mod gguf;
pub mod hparams;
pub mod loader;
pub mod synth;
pub mod tensors;
pub mod types;
pub mod vocab;
pub mod writer;

use std::path::Path;

pub use gguf::{GgufFile, MetaValue, TensorInfo};
pub use hparams::ModelHparams;
pub use loader::{ContainerError, MappedModel};
pub use synth::{SynthConfig, SynthTensor};
pub use tensors::LayerTensor;
pub use types::GgmlType;
pub use vocab::{SpecialTokens, TokenKind, Vocabulary};
pub use writer::ContainerWriter;

/// A parsed, validated model file backed by a read-only mapping.
pub struct ModelContainer {
    mapped: MappedModel,
    file: GgufFile,
    hparams: ModelHparams,
    vocab: Vocabulary,
}

impl ModelContainer {
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        let mapped = MappedModel::open(path)?;
        let file = GgufFile::parse(mapped.as_bytes())?;

        if let Some(t) = file.tensors().iter().find(|t| !t.ty.is_executable()) {
            return Err(ContainerError::UnsupportedQuantization {
                tensor: t.name.clone(),
                ty: t.ty,
            });
        }

        let vocab = if file.get(vocab::KEY_TOKENS).is_some() {
            Vocabulary::from_gguf(&file)?
        } else {
            let sidecar = vocab::sidecar_path(path);
            if !sidecar.is_file() {
                return Err(ContainerError::MissingMetadata(vocab::KEY_TOKENS.into()));
            }
            tracing::debug!(vocab = %sidecar.display(), "using sidecar vocabulary file");
            Vocabulary::from_file(&sidecar)?.with_metadata(&file)?
        };
        let hparams = ModelHparams::from_gguf(&file, vocab.len())?;

        tracing::debug!(
            path = %path.display(),
            version = file.version,
            tensors = file.tensors().len(),
            metadata = file.metadata_len(),
            vocab = vocab.len(),
            "parsed container"
        );

        Ok(Self {
            mapped,
            file,
            hparams,
            vocab,
        })
    }

    pub fn gguf(&self) -> &GgufFile {
        &self.file
    }

    pub fn hparams(&self) -> &ModelHparams {
        &self.hparams
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn name(&self) -> String {
        self.file
            .get_str("general.name")
            .map(str::to_string)
            .unwrap_or_else(|| self.mapped.name())
    }

    /// Size of the mapped file in bytes.
    pub fn file_len(&self) -> usize {
        self.mapped.len()
    }

    /// Borrow a tensor's encoded bytes from the mapping.
    pub fn tensor_bytes(&self, info: &TensorInfo) -> &[u8] {
        // Ranges were bounds-checked during parse.
        &self.mapped.as_bytes()[info.start as usize..info.end() as usize]
    }

    pub fn bytes(&self) -> &[u8] {
        self.mapped.as_bytes()
    }
}

impl std::fmt::Debug for ModelContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelContainer")
            .field("mapped", &self.mapped)
            .field("hparams", &self.hparams)
            .field("vocab_size", &self.vocab.len())
            .finish()
    }
}
