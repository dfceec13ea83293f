//! pocket-llm
//!
//! An on-device inference engine for llama-family models stored as GGUF.
//! One process, one model, no network.
//!
//! # Pipeline
//!
//! - **Container**: the model file is memory mapped, parsed and validated
//!   ([`models::ModelContainer`])
//! - **Device**: the host is probed once for its accelerator family and
//!   memory budget ([`engine::DeviceProfiler`])
//! - **Kernels**: per-op kernels are compiled for that capability, self
//!   tested and cached on disk ([`engine::KernelProvider`])
//! - **Memory**: weights, activations, the key/value cache and per-request
//!   buffers are charged to one budgeted [`memory::Arena`]
//! - **Generation**: the execution graph runs prefill and decode, and the
//!   sampler picks tokens until a stop condition ([`engine::GenerationSession`])
//!
//! [`Engine`] ties these together behind four calls: load, generate, device
//! info and unload. The same calls are exported over a C ABI in [`ffi`].
//!
//! ```no_run
//! use std::path::Path;
//! use pocket_llm::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.load(Path::new("model.gguf"), Path::new("kernel-cache"))?;
//! let out = engine.generate("Once upon a time", 32)?;
//! println!("{}", out.full_text());
//! engine.unload()?;
//! # Ok::<(), pocket_llm::EngineError>(())
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod ffi;
pub mod memory;
pub mod models;
pub mod telemetry;

pub use config::{ConfigError, EngineConfig};
pub use engine::{
    CancelToken, DeviceCapability, DeviceProfiler, Engine, EngineError, EngineState, ErrorKind,
    FinishReason, GenerationOutput, GenerationParams, ModelInfo, SamplingConfig, TokenEvent,
};
pub use memory::{Arena, KvPrecision};
pub use models::{ModelContainer, SynthConfig};
