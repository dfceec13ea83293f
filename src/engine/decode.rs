//! Generation loop: prompt evaluation followed by token-by-token decoding.
//!
//! A session borrows the loaded model's graph, key/value cache and
//! tokenizer for the duration of one generate call. Failures after the
//! session starts are wrapped in [`EngineError::Aborted`] carrying the text
//! produced so far; the model itself stays usable.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::memory::{Arena, KvCache, Owner, SizeClass};

use super::config::GenerationParams;
use super::error::EngineError;
use super::graph::ExecutionGraph;
use super::output::{FinishReason, GenerationOutput, GenerationStats, TokenEvent};
use super::sampler::Sampler;
use super::tokenizer::{StreamDecoder, Tokenizer};

/// Cooperative cancellation flag, checked once per generated token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Borrowed pieces of a loaded model a session runs against.
pub struct SessionParts<'a> {
    pub graph: &'a mut ExecutionGraph,
    pub cache: &'a mut KvCache,
    pub tokenizer: &'a Tokenizer,
    pub weights: &'a [u8],
    pub arena: &'a Arena,
}

/// One generate call.
pub struct GenerationSession<'a> {
    parts: SessionParts<'a>,
    sampler: Sampler,
    params: GenerationParams,
    history: Vec<u32>,
    generated: Vec<u32>,
    logits: Vec<f32>,
    prefill: Duration,
    decode: Duration,
}

impl<'a> GenerationSession<'a> {
    pub fn new(parts: SessionParts<'a>, params: GenerationParams) -> Result<Self, EngineError> {
        params.validate()?;
        Ok(Self {
            sampler: Sampler::new(params.sampling.clone()),
            logits: Vec::new(),
            parts,
            params,
            history: Vec::new(),
            generated: Vec::new(),
            prefill: Duration::ZERO,
            decode: Duration::ZERO,
        })
    }

    /// Run to completion. `on_token` sees every generated token; returning
    /// `Break` stops like cancellation.
    pub fn run(
        mut self,
        request_id: &str,
        prompt: &str,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&TokenEvent) -> ControlFlow<()>,
    ) -> Result<GenerationOutput, EngineError> {
        let mut prompt_ids = self.parts.tokenizer.encode_prompt(prompt)?;
        if prompt_ids.is_empty() {
            prompt_ids.push(self.parts.tokenizer.bos());
        }
        let capacity = self.parts.cache.capacity();
        if prompt_ids.len() > capacity {
            return Err(EngineError::InvalidInput(format!(
                "prompt of {} tokens exceeds context length {}",
                prompt_ids.len(),
                capacity
            )));
        }

        // Per-session scratch, returned to the arena when the call ends.
        let arena = self.parts.arena;
        let _scratch = arena.lease(
            SizeClass::for_elements::<f32>(self.parts.graph.vocab_size()),
            Owner::Session,
        )?;
        self.parts.cache.clear();

        let finish = match self.generate(&prompt_ids, cancel, on_token) {
            Ok(reason) => reason,
            Err(cause) => {
                let partial_text = self.parts.tokenizer.decode(&self.generated);
                tracing::warn!(
                    request_id,
                    error = %cause,
                    tokens_generated = self.generated.len(),
                    "Generation aborted"
                );
                self.parts.cache.clear();
                return Err(EngineError::Aborted {
                    cause: Box::new(cause),
                    partial_text,
                    tokens_generated: self.generated.len(),
                });
            }
        };

        let text = self.parts.tokenizer.decode(&self.generated);
        let profile = self.parts.graph.profile().map(|p| p.snapshot()).unwrap_or_default();
        Ok(GenerationOutput {
            request_id: request_id.to_string(),
            prompt: prompt.to_string(),
            text,
            prompt_tokens: prompt_ids.len(),
            finish_reason: finish,
            stats: GenerationStats {
                prompt_tokens: prompt_ids.len(),
                generated_tokens: self.generated.len(),
                prefill: self.prefill,
                decode: self.decode,
                kernels: profile,
            },
            tokens: self.generated,
        })
    }

    fn generate(
        &mut self,
        prompt_ids: &[u32],
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&TokenEvent) -> ControlFlow<()>,
    ) -> Result<FinishReason, EngineError> {
        if self.params.max_tokens == 0 {
            return Ok(FinishReason::MaxTokens);
        }

        let started = Instant::now();
        self.evaluate_prompt(prompt_ids)?;
        self.prefill = started.elapsed();

        let started = Instant::now();
        let finish = self.decode_loop(cancel, on_token);
        self.decode = started.elapsed();
        finish
    }

    /// Feed the prompt through the graph, keeping only the last logits.
    fn evaluate_prompt(&mut self, prompt_ids: &[u32]) -> Result<(), EngineError> {
        let last = prompt_ids.len() - 1;
        for (pos, &token) in prompt_ids.iter().enumerate() {
            let logits = self
                .parts
                .graph
                .forward(self.parts.weights, token, pos, self.parts.cache, pos == last)?;
            if let Some(l) = logits {
                self.logits.clear();
                self.logits.extend_from_slice(l);
            }
        }
        self.history.extend_from_slice(prompt_ids);
        Ok(())
    }

    fn decode_loop(
        &mut self,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&TokenEvent) -> ControlFlow<()>,
    ) -> Result<FinishReason, EngineError> {
        let mut stream = StreamDecoder::new();
        let finish = self.decode_tokens(&mut stream, cancel, on_token);

        // Bytes of a character cut off by the stop still reach the callback,
        // so the streamed text always adds up to the returned text.
        if let (Ok(_), Some(&last)) = (&finish, self.generated.last()) {
            let tail = stream.finish();
            if !tail.is_empty() {
                let _ = on_token(&TokenEvent {
                    index: self.generated.len() - 1,
                    token: last,
                    text: tail,
                });
            }
        }
        finish
    }

    fn decode_tokens(
        &mut self,
        stream: &mut StreamDecoder,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&TokenEvent) -> ControlFlow<()>,
    ) -> Result<FinishReason, EngineError> {
        if cancel.is_cancelled() {
            return Ok(FinishReason::Cancelled);
        }
        loop {
            let next = self.sampler.sample(&mut self.logits, &self.history);
            if !self.params.ignore_eos && self.parts.tokenizer.is_eos(next) {
                return Ok(FinishReason::Stop);
            }
            self.generated.push(next);
            self.history.push(next);

            let limit = if self.generated.len() >= self.params.max_tokens {
                Some(FinishReason::MaxTokens)
            } else if self.parts.cache.is_full() {
                Some(FinishReason::ContextExhausted)
            } else {
                None
            };
            let mut text = stream.push(self.parts.tokenizer, next);
            if limit.is_some() {
                text.push_str(&stream.finish());
            }
            let event = TokenEvent {
                index: self.generated.len() - 1,
                token: next,
                text,
            };
            if on_token(&event).is_break() {
                return Ok(FinishReason::Cancelled);
            }
            if let Some(reason) = limit {
                return Ok(reason);
            }
            if cancel.is_cancelled() {
                return Ok(FinishReason::Cancelled);
            }

            let pos = self.parts.cache.len();
            let logits = self
                .parts
                .graph
                .forward(self.parts.weights, next, pos, self.parts.cache, true)?
                .ok_or_else(|| EngineError::InvalidInput("graph returned no logits".into()))?;
            self.logits.clear();
            self.logits.extend_from_slice(logits);
        }
    }
}
