//! Generation output types.

use std::time::Duration;

use serde::Serialize;

use super::kernels::OpTiming;

/// Reason why text generation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    /// Model emitted the end-of-sequence token.
    Stop,
    /// Hit the max_tokens limit.
    MaxTokens,
    /// The context window filled up. A normal stop, not a failure.
    ContextExhausted,
    /// Cancelled by the caller or the token callback.
    Cancelled,
}

impl FinishReason {
    pub fn name(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::MaxTokens => "max_tokens",
            Self::ContextExhausted => "context_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One streamed token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEvent {
    /// Zero-based index among generated tokens.
    pub index: usize,
    pub token: u32,
    /// Text that became complete with this token. May be empty while a
    /// multi-byte character is still being assembled. If generation stops
    /// mid-character, the leftover bytes arrive lossily in the final event,
    /// which repeats the last token's index when that token was already
    /// delivered.
    pub text: String,
}

/// Timing and throughput for one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prefill: Duration,
    pub decode: Duration,
    /// Per-op kernel timings when profiling is enabled.
    pub kernels: Vec<OpTiming>,
}

impl GenerationStats {
    pub fn total(&self) -> Duration {
        self.prefill + self.decode
    }

    pub fn prefill_tokens_per_sec(&self) -> f64 {
        rate(self.prompt_tokens, self.prefill)
    }

    pub fn decode_tokens_per_sec(&self) -> f64 {
        rate(self.generated_tokens, self.decode)
    }
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

/// Result of a completed generate call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutput {
    pub request_id: String,
    pub prompt: String,
    /// Decoded continuation, without the prompt.
    pub text: String,
    /// Generated token ids.
    pub tokens: Vec<u32>,
    pub prompt_tokens: usize,
    pub finish_reason: FinishReason,
    pub stats: GenerationStats,
}

impl GenerationOutput {
    /// Prompt followed by the continuation, as returned to hosts.
    pub fn full_text(&self) -> String {
        let mut s = String::with_capacity(self.prompt.len() + self.text.len());
        s.push_str(&self.prompt);
        s.push_str(&self.text);
        s
    }

    pub fn tokens_generated(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_handle_zero_durations() {
        let stats = GenerationStats {
            prompt_tokens: 4,
            generated_tokens: 10,
            prefill: Duration::ZERO,
            decode: Duration::from_millis(500),
            kernels: Vec::new(),
        };
        assert_eq!(stats.prefill_tokens_per_sec(), 0.0);
        assert!((stats.decode_tokens_per_sec() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn full_text_echoes_prompt() {
        let out = GenerationOutput {
            request_id: "r".into(),
            prompt: "Hello".into(),
            text: ", world".into(),
            tokens: vec![5, 6],
            prompt_tokens: 2,
            finish_reason: FinishReason::MaxTokens,
            stats: GenerationStats::default(),
        };
        assert_eq!(out.full_text(), "Hello, world");
        assert_eq!(out.tokens_generated(), 2);
    }
}
