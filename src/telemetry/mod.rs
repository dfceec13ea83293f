//! Telemetry for the engine: structured logging, spans and metrics.
//!
//! Everything is emitted through the `tracing` and `metrics` facades. The
//! host decides where it goes by installing a subscriber or recorder; the
//! engine itself never opens a network connection.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_arena_usage, record_generation, record_generation_failure,
    record_kernel_cache, record_load, record_load_failure, record_unload,
};
pub use spans::{GenerationSpan, LoadSpan, SpanExt};
