//! Engine error types.
//!
//! Component errors convert into [`EngineError`] with `?`. [`ErrorKind`]
//! flattens the tree into the categories callers branch on.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::kernels::KernelError;
use super::state::EngineState;
use super::tokenizer::TokenizerError;
use crate::memory::{ArenaError, KvCacheError};
use crate::models::ContainerError;

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error(transparent)]
    KvCache(#[from] KvCacheError),

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    #[error("Numeric instability: non-finite activations after layer {layer}")]
    NumericInstability { layer: usize },

    #[error("Engine busy: {0}")]
    Busy(EngineState),

    #[error("Engine not ready: {0}")]
    NotReady(EngineState),

    #[error("A model is already loaded; unload it first")]
    AlreadyLoaded,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Generation aborted after {tokens_generated} tokens: {cause}")]
    Aborted {
        cause: Box<EngineError>,
        partial_text: String,
        tokens_generated: usize,
    },
}

/// Error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Format,
    Truncated,
    UnsupportedQuantization,
    KernelCompile,
    CacheCorrupt,
    OutOfMemory,
    NumericInstability,
    ContextLengthExceeded,
    Busy,
    NotReady,
    AlreadyLoaded,
    InvalidInput,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Format => "FormatError",
            Self::Truncated => "TruncatedFileError",
            Self::UnsupportedQuantization => "UnsupportedQuantizationError",
            Self::KernelCompile => "KernelCompileError",
            Self::CacheCorrupt => "CacheCorruptError",
            Self::OutOfMemory => "OutOfMemoryError",
            Self::NumericInstability => "NumericInstabilityError",
            Self::ContextLengthExceeded => "ContextLengthExceededError",
            Self::Busy => "BusyError",
            Self::NotReady => "NotReadyError",
            Self::AlreadyLoaded => "AlreadyLoadedError",
            Self::InvalidInput => "InvalidInputError",
            Self::Io => "IoError",
            Self::Internal => "InternalError",
        }
    }

    /// Stable negative code for the C ABI. Zero is success.
    pub fn code(self) -> i32 {
        match self {
            Self::Format => -1,
            Self::Truncated => -2,
            Self::UnsupportedQuantization => -3,
            Self::KernelCompile => -4,
            Self::CacheCorrupt => -5,
            Self::OutOfMemory => -6,
            Self::NumericInstability => -7,
            Self::ContextLengthExceeded => -8,
            Self::Busy => -9,
            Self::NotReady => -10,
            Self::AlreadyLoaded => -11,
            Self::InvalidInput => -12,
            Self::Io => -13,
            Self::Internal => -99,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Container(e) => match e {
                ContainerError::Truncated { .. } => ErrorKind::Truncated,
                ContainerError::UnsupportedQuantization { .. } => ErrorKind::UnsupportedQuantization,
                ContainerError::NotFound(_) | ContainerError::Io(_) => ErrorKind::Io,
                _ => ErrorKind::Format,
            },
            Self::Kernel(e) => match e {
                KernelError::Compile { .. } | KernelError::Missing(_) => ErrorKind::KernelCompile,
                KernelError::CacheCorrupt { .. } => ErrorKind::CacheCorrupt,
                KernelError::Io(_) => ErrorKind::Io,
            },
            Self::Arena(ArenaError::OutOfMemory { .. }) => ErrorKind::OutOfMemory,
            Self::Arena(_) => ErrorKind::Internal,
            Self::KvCache(KvCacheError::Full { .. }) => ErrorKind::ContextLengthExceeded,
            Self::KvCache(_) => ErrorKind::Internal,
            Self::Tokenizer(_) => ErrorKind::InvalidInput,
            Self::NumericInstability { .. } => ErrorKind::NumericInstability,
            Self::Busy(_) => ErrorKind::Busy,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::AlreadyLoaded => ErrorKind::AlreadyLoaded,
            Self::InvalidInput(_) | Self::Config(_) => ErrorKind::InvalidInput,
            Self::Aborted { cause, .. } => cause.kind(),
        }
    }

    /// Text produced before a mid-generation failure, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Self::Aborted { partial_text, .. } => Some(partial_text),
            _ => None,
        }
    }

    /// State-machine rejections that leave the engine untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::NotReady(_) | Self::AlreadyLoaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_reports_root_cause() {
        let e = EngineError::Aborted {
            cause: Box::new(EngineError::NumericInstability { layer: 3 }),
            partial_text: "abc".into(),
            tokens_generated: 2,
        };
        assert_eq!(e.kind(), ErrorKind::NumericInstability);
        assert_eq!(e.partial_text(), Some("abc"));
        assert!(e.to_string().contains("layer 3"));
    }

    #[test]
    fn container_errors_map_to_taxonomy() {
        let e: EngineError = ContainerError::Truncated {
            what: "tensor".into(),
            start: 0,
            end: 10,
            file_len: 5,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Truncated);
        let e: EngineError = ContainerError::Format("bad magic".into()).into();
        assert_eq!(e.kind(), ErrorKind::Format);
    }

    #[test]
    fn codes_are_distinct() {
        let kinds = [
            ErrorKind::Format,
            ErrorKind::Truncated,
            ErrorKind::UnsupportedQuantization,
            ErrorKind::KernelCompile,
            ErrorKind::CacheCorrupt,
            ErrorKind::OutOfMemory,
            ErrorKind::NumericInstability,
            ErrorKind::ContextLengthExceeded,
            ErrorKind::Busy,
            ErrorKind::NotReady,
            ErrorKind::AlreadyLoaded,
            ErrorKind::InvalidInput,
            ErrorKind::Io,
            ErrorKind::Internal,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| *c < 0));
    }
}
