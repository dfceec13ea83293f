//! Engine facade: the load / generate / device-info / unload lifecycle.
//!
//! One [`Engine`] owns at most one loaded model. Lifecycle calls are
//! synchronous and may come from any thread; the state machine in
//! [`EngineState`] decides which of them may proceed. Long-running work
//! (loading, decoding) happens outside the state lock so callers asking for
//! device info or the current state never block behind it.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::memory::{Arena, KvCache, KvLayout, KvPrecision, MemorySpace, Owner, SizeClass};
use crate::models::{GgmlType, ModelContainer};
use crate::telemetry::{self, GenerationSpan, LoadSpan, SpanExt};

use super::config::GenerationParams;
use super::decode::{CancelToken, GenerationSession, SessionParts};
use super::device::{precision_name, DeviceCapability};
use super::error::EngineError;
use super::graph::ExecutionGraph;
use super::kernels::{KernelProfile, KernelProvider, KernelSet, KernelSource};
use super::output::{GenerationOutput, TokenEvent};
use super::state::EngineState;
use super::tokenizer::Tokenizer;

/// Prefix of the string [`Engine::generate_text`] returns on failure.
pub const ERROR_PREFIX: &str = "[error] ";

/// Description of the loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: PathBuf,
    pub architecture: String,
    pub quantization: GgmlType,
    pub n_layers: usize,
    pub hidden: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    /// Positions available to one generation, after any configured cap.
    pub context_length: usize,
    pub vocab_size: usize,
    pub file_bytes: usize,
    pub kv_precision: &'static str,
    pub kernel_source: KernelSource,
    pub kernel_count: usize,
}

/// Arena accounting broken down by owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaUsage {
    pub budget: usize,
    pub used: usize,
    pub peak: usize,
    pub live: usize,
    pub weights: usize,
    pub activations: usize,
    pub kv_cache: usize,
    pub kernels: usize,
    pub session: usize,
}

struct LoadedModel {
    container: ModelContainer,
    tokenizer: Tokenizer,
    graph: ExecutionGraph,
    cache: KvCache,
    // Keeps the set alive for as long as the graph's kernel handles.
    _kernels: Arc<KernelSet>,
    cache_dir: PathBuf,
}

struct Slot {
    state: EngineState,
    model: Option<LoadedModel>,
    info: Option<ModelInfo>,
    last_error: Option<String>,
}

/// On-device inference engine.
pub struct Engine {
    config: EngineConfig,
    capability: DeviceCapability,
    arena: Arena,
    kernels: KernelProvider,
    slot: Mutex<Slot>,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let capability = config.capability();
        let budget = usize::try_from(capability.memory_budget).unwrap_or(usize::MAX);
        tracing::debug!(
            family = %capability.family,
            budget,
            precision = precision_name(capability.precision),
            "engine created"
        );
        Self {
            kernels: KernelProvider::new(config.kernel_cache.provider_config()),
            arena: Arena::new(budget),
            capability,
            config,
            slot: Mutex::new(Slot {
                state: EngineState::Unloaded,
                model: None,
                info: None,
                last_error: None,
            }),
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capability(&self) -> &DeviceCapability {
        &self.capability
    }

    pub fn state(&self) -> EngineState {
        self.slot.lock().state
    }

    /// Message of the most recent failed operation.
    pub fn last_error(&self) -> Option<String> {
        self.slot.lock().last_error.clone()
    }

    /// Available while a model is loaded, including during generation.
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.slot.lock().info.clone()
    }

    pub fn arena_usage(&self) -> ArenaUsage {
        let a = &self.arena;
        ArenaUsage {
            budget: a.budget(),
            used: a.used(),
            peak: a.peak(),
            live: a.live(),
            weights: a.used_by(Owner::Weights),
            activations: a.used_by(Owner::Activations),
            kv_cache: a.used_by(Owner::KvCache),
            kernels: a.used_by(Owner::Kernels),
            session: a.used_by(Owner::Session),
        }
    }

    /// Handle that stops the in-flight generation at the next token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation of the in-flight generation, if any.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Capability summary plus the engine state. Never blocks on a load or
    /// generation.
    pub fn device_info(&self) -> String {
        format!(
            "{}\nEngine state: {}",
            self.capability.summary(),
            self.state()
        )
    }

    /// Load a model. Kernels are compiled for this device or read from
    /// `cache_dir`.
    ///
    /// A failed load releases everything it allocated and leaves the engine
    /// in [`EngineState::Failed`], from which loading may be retried.
    pub fn load(&self, model_path: &Path, cache_dir: &Path) -> Result<(), EngineError> {
        {
            let mut slot = self.slot.lock();
            match slot.state {
                EngineState::Loading | EngineState::Generating => {
                    return Err(EngineError::Busy(slot.state))
                }
                EngineState::Ready => return Err(EngineError::AlreadyLoaded),
                EngineState::Unloaded | EngineState::Failed => {}
            }
            slot.state = EngineState::Loading;
        }

        let span = LoadSpan::new(model_path, cache_dir);
        let _enter = span.enter();
        let started = Instant::now();
        let mut guard = LoadGuard { engine: self, done: false };

        let result = self.load_model_parts(model_path, cache_dir);
        span.record_result(&result);
        span.record("latency_ms", started.elapsed().as_millis() as u64);

        let mut slot = self.slot.lock();
        guard.done = true;
        match result {
            Ok((model, info)) => {
                span.record("kernel_source", format!("{:?}", info.kernel_source).as_str());
                tracing::info!(
                    model = %info.name,
                    layers = info.n_layers,
                    context = info.context_length,
                    arena_used = self.arena.used(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                telemetry::record_load(started.elapsed());
                slot.model = Some(model);
                slot.info = Some(info);
                slot.last_error = None;
                slot.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                let freed = self.arena.release_all();
                tracing::error!(error = %e, kind = %e.kind(), freed, "model load failed");
                telemetry::record_load_failure(e.kind().name());
                slot.last_error = Some(e.to_string());
                slot.state = EngineState::Failed;
                Err(e)
            }
        }
    }

    fn load_model_parts(
        &self,
        model_path: &Path,
        cache_dir: &Path,
    ) -> Result<(LoadedModel, ModelInfo), EngineError> {
        let container = ModelContainer::open(model_path)?;
        self.arena.allocate_in(
            SizeClass::for_bytes(container.file_len()),
            Owner::Weights,
            MemorySpace::Mapped,
        )?;

        let kernels = self.kernels.get_or_compile(&self.capability, cache_dir)?;
        self.arena
            .allocate(SizeClass::for_bytes(kernels.footprint()), Owner::Kernels)?;

        let profile = self
            .config
            .profile_kernels
            .then(|| Arc::new(KernelProfile::default()));
        let graph = ExecutionGraph::build(&container, &kernels, &self.arena, profile)?;

        let hp = container.hparams().clone();
        let context_length = self
            .config
            .max_context
            .map_or(hp.context_length, |cap| cap.min(hp.context_length));
        let layout = KvLayout {
            n_layers: hp.n_layers,
            n_kv_heads: hp.n_kv_heads,
            head_dim: hp.head_dim(),
            capacity: context_length,
        };
        let precision: KvPrecision = self.capability.precision;
        let cache = KvCache::new(&self.arena, layout, precision)?;
        let tokenizer = Tokenizer::new(container.vocab().clone());
        if !tokenizer.has_full_byte_coverage() {
            tracing::warn!("vocabulary lacks byte tokens; uncovered text maps to the unknown token");
        }

        let info = ModelInfo {
            name: container.name(),
            path: model_path.to_path_buf(),
            architecture: hp.architecture.clone(),
            quantization: hp.quantization,
            n_layers: hp.n_layers,
            hidden: hp.hidden,
            n_heads: hp.n_heads,
            n_kv_heads: hp.n_kv_heads,
            context_length,
            vocab_size: hp.vocab_size,
            file_bytes: container.file_len(),
            kv_precision: precision_name(precision),
            kernel_source: kernels.source(),
            kernel_count: kernels.len(),
        };
        let model = LoadedModel {
            container,
            tokenizer,
            graph,
            cache,
            _kernels: kernels,
            cache_dir: cache_dir.to_path_buf(),
        };
        Ok((model, info))
    }

    /// Generate with the configured sampling.
    pub fn generate(&self, prompt: &str, max_tokens: usize) -> Result<GenerationOutput, EngineError> {
        let params = GenerationParams::new(max_tokens, self.config.sampling.clone());
        self.generate_with(prompt, params, |_| ControlFlow::Continue(()))
    }

    /// Take the model out of the slot and enter `Generating`. The cancel
    /// flag is cleared under the lock, so any cancel issued once the state
    /// reads `Generating` applies to this generation.
    fn begin_generation(&self) -> Result<(LoadedModel, String), EngineError> {
        let mut slot = self.slot.lock();
        match slot.state {
            EngineState::Ready => {}
            EngineState::Loading | EngineState::Generating => return Err(EngineError::Busy(slot.state)),
            EngineState::Unloaded | EngineState::Failed => return Err(EngineError::NotReady(slot.state)),
        }
        let model = slot.model.take().ok_or(EngineError::NotReady(slot.state))?;
        let name = slot.info.as_ref().map(|i| i.name.clone()).unwrap_or_default();
        self.cancel.reset();
        slot.state = EngineState::Generating;
        Ok((model, name))
    }

    /// Generate, streaming each token to `on_token`.
    ///
    /// Only one generation runs at a time; a concurrent call fails with
    /// [`EngineError::Busy`] instead of waiting.
    pub fn generate_with<F>(
        &self,
        prompt: &str,
        params: GenerationParams,
        mut on_token: F,
    ) -> Result<GenerationOutput, EngineError>
    where
        F: FnMut(&TokenEvent) -> ControlFlow<()>,
    {
        let (model, model_name) = self.begin_generation()?;
        let mut guard = GenerationGuard {
            slot: &self.slot,
            model: Some(model),
        };

        let request_id = Uuid::new_v4().to_string();
        let span = GenerationSpan::new(&request_id, &model_name, params.max_tokens);
        let _enter = span.enter();
        let started = Instant::now();

        let result = match guard.model.as_mut() {
            Some(model) => {
                if let Some(profile) = model.graph.profile() {
                    profile.reset();
                }
                let parts = SessionParts {
                    graph: &mut model.graph,
                    cache: &mut model.cache,
                    tokenizer: &model.tokenizer,
                    weights: model.container.bytes(),
                    arena: &self.arena,
                };
                GenerationSession::new(parts, params)
                    .and_then(|s| s.run(&request_id, prompt, &self.cancel, &mut on_token))
            }
            None => Err(EngineError::NotReady(EngineState::Generating)),
        };
        drop(guard);

        let elapsed = started.elapsed();
        span.record_result(&result);
        span.record("latency_ms", elapsed.as_millis() as u64);
        match &result {
            Ok(out) => {
                span.record("finish_reason", out.finish_reason.name());
                span.record("tokens_generated", out.tokens.len() as u64);
                tracing::info!(
                    prompt_tokens = out.prompt_tokens,
                    tokens = out.tokens.len(),
                    finish = out.finish_reason.name(),
                    decode_tps = out.stats.decode_tokens_per_sec(),
                    "generation finished"
                );
                telemetry::record_generation(
                    out.finish_reason.name(),
                    out.tokens.len(),
                    elapsed,
                    out.stats.decode_tokens_per_sec(),
                );
            }
            Err(e) => {
                let tokens = match e {
                    EngineError::Aborted { tokens_generated, .. } => *tokens_generated,
                    _ => 0,
                };
                span.record("tokens_generated", tokens as u64);
                tracing::warn!(error = %e, kind = %e.kind(), "generation failed");
                telemetry::record_generation_failure(e.kind().name(), tokens);
                self.slot.lock().last_error = Some(e.to_string());
            }
        }
        result
    }

    /// Release the model and every arena allocation. A no-op when nothing
    /// is loaded; refused while a load or generation is in flight.
    pub fn unload(&self) -> Result<(), EngineError> {
        let mut slot = self.slot.lock();
        match slot.state {
            EngineState::Loading | EngineState::Generating => {
                return Err(EngineError::Busy(slot.state))
            }
            EngineState::Unloaded => return Ok(()),
            EngineState::Ready | EngineState::Failed => {}
        }

        // Released under the lock so a following load cannot interleave.
        let model = slot.model.take();
        slot.info = None;
        let cache_dir = model.as_ref().map(|m| m.cache_dir.clone());
        drop(model);
        let freed = self.arena.release_all();
        let flushed = match (&cache_dir, self.config.flush_kernels_on_unload) {
            (Some(dir), true) => self.kernels.flush(Some(dir)),
            _ => 0,
        };
        slot.state = EngineState::Unloaded;
        drop(slot);

        tracing::info!(freed, flushed, "model unloaded");
        telemetry::record_unload();
        Ok(())
    }

    // -- Host surface ---------------------------------------------------------
    // String-in, string-out wrappers for hosts that cannot take Rust errors.

    /// `true` on success. The failure reason is kept in [`Engine::last_error`].
    pub fn load_model(&self, model_path: &str, cache_dir: &str) -> bool {
        self.load(Path::new(model_path), Path::new(cache_dir)).is_ok()
    }

    /// Prompt followed by the continuation. A generation that failed midway
    /// still returns the text produced so far; any other failure returns a
    /// message starting with [`ERROR_PREFIX`].
    pub fn generate_text(&self, prompt: &str, max_tokens: usize) -> String {
        match self.generate(prompt, max_tokens) {
            Ok(out) => out.full_text(),
            Err(EngineError::Aborted { partial_text, .. }) => {
                let mut s = String::with_capacity(prompt.len() + partial_text.len());
                s.push_str(prompt);
                s.push_str(&partial_text);
                s
            }
            Err(e) => format!("{}{}: {}", ERROR_PREFIX, e.kind().name(), e),
        }
    }

    pub fn get_device_info(&self) -> String {
        self.device_info()
    }

    pub fn unload_model(&self) {
        if let Err(e) = self.unload() {
            tracing::warn!(error = %e, "unload refused");
            self.slot.lock().last_error = Some(e.to_string());
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        slot.model = None;
        self.arena.release_all();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("family", &self.capability.family)
            .field("arena", &self.arena)
            .finish()
    }
}

/// Marks a load that never finished as failed, e.g. after a panic.
struct LoadGuard<'a> {
    engine: &'a Engine,
    done: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.engine.arena.release_all();
            let mut slot = self.engine.slot.lock();
            slot.state = EngineState::Failed;
            slot.last_error = Some("load interrupted".into());
        }
    }
}

/// Returns the model to the slot when a generation ends, however it ends.
struct GenerationGuard<'a> {
    slot: &'a Mutex<Slot>,
    model: Option<LoadedModel>,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        slot.model = self.model.take();
        slot.state = if slot.model.is_some() {
            EngineState::Ready
        } else {
            EngineState::Failed
        };
    }
}

#[cfg(test)]
#[path = "inference_tests.rs"]
mod tests;
