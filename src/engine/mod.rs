//! Inference engine: device profiling, kernels, the execution graph, the
//! generation loop and the [`Engine`] facade that ties them together.

pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod flash_attn;
pub mod graph;
pub mod kernels;
pub mod output;
pub mod quantize;
pub mod sampler;
pub mod simd_matmul;
mod simd_neon;
pub mod state;
pub mod tokenizer;

mod inference;

pub use config::{GenerationParams, SamplingConfig};
pub use decode::{CancelToken, GenerationSession, SessionParts};
pub use device::{AcceleratorFamily, DeviceCapability, DeviceProfiler};
pub use error::{EngineError, ErrorKind};
pub use flash_attn::{FlashAttn, FlashAttnConfig};
pub use graph::ExecutionGraph;
pub use inference::{ArenaUsage, Engine, ModelInfo, ERROR_PREFIX};
pub use kernels::{
    CompiledKernel, KernelError, KernelProfile, KernelProvider, KernelProviderConfig, KernelSet,
    KernelSource, OpKind, OpTiming,
};
pub use output::{FinishReason, GenerationOutput, GenerationStats, TokenEvent};
pub use sampler::Sampler;
pub use state::EngineState;
pub use tokenizer::{StreamDecoder, Tokenizer, TokenizerError};
