//! Container errors and read-only memory mapping of model files.

use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::types::GgmlType;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Model file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid container format: {0}")]
    Format(String),

    #[error("Truncated container: {what} needs bytes {start}..{end} but file is {file_len} bytes")]
    Truncated {
        what: String,
        start: u64,
        end: u64,
        file_len: u64,
    },

    #[error("Unsupported quantization {ty} for tensor '{tensor}'")]
    UnsupportedQuantization { tensor: String, ty: GgmlType },

    #[error("Missing metadata key: {0}")]
    MissingMetadata(String),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Tensor '{tensor}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<u64>,
        actual: Vec<u64>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Memory-mapped model file for zero-copy tensor access.
pub struct MappedModel {
    path: PathBuf,
    mmap: Mmap,
}

// SAFETY: the mapping is read-only and model files are not modified while
// an engine holds them.
unsafe impl Send for MappedModel {}
unsafe impl Sync for MappedModel {}

impl MappedModel {
    /// Map a model file. The file handle is closed once the mapping exists.
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        if !path.is_file() {
            return Err(ContainerError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        // SAFETY: opened read-only; the host does not rewrite model files in place
        let mmap = unsafe { Mmap::map(&file)? };
        drop(file);
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Model name derived from the file stem.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

impl std::fmt::Debug for MappedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedModel")
            .field("path", &self.path)
            .field("len", &self.mmap.len())
            .finish()
    }
}
