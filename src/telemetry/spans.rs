//! Standard spans for engine operations.

use std::path::Path;

use tracing::{info_span, Span};

/// Record an operation's outcome into the current span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Span around one generate call.
pub struct GenerationSpan;

impl GenerationSpan {
    /// `status`, `error.message`, `finish_reason`, `latency_ms` and
    /// `tokens_generated` are filled in on completion.
    pub fn new(request_id: &str, model: &str, max_tokens: usize) -> Span {
        info_span!(
            "generate",
            request_id = %request_id,
            model = %model,
            max_tokens,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            finish_reason = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            tokens_generated = tracing::field::Empty,
        )
    }
}

/// Span around a model load.
pub struct LoadSpan;

impl LoadSpan {
    pub fn new(model_path: &Path, cache_dir: &Path) -> Span {
        info_span!(
            "load",
            model = %model_path.display(),
            cache_dir = %cache_dir.display(),
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            kernel_source = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
