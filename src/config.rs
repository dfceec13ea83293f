//! Engine configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `POCKET_LLM_*` environment variables. Invalid environment values fall back
//! to whatever the earlier layers produced without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `POCKET_LLM_MEMORY_BUDGET` | probed | Arena budget in bytes |
//! | `POCKET_LLM_PRECISION` | probed | Key/value precision (`f32`/`f16`) |
//! | `POCKET_LLM_MAX_CONTEXT` | model | Cap on the model's context length |
//! | `POCKET_LLM_KERNEL_LOCK_WAIT_MS` | 2000 | Wait for another writer's cache claim |
//! | `POCKET_LLM_KERNEL_LOCK_STALE_SECS` | 60 | Age after which a claim is abandoned |
//! | `POCKET_LLM_PERSIST_KERNELS` | true | Write compiled kernels to the cache dir |
//! | `POCKET_LLM_FLUSH_KERNELS` | false | Drop in-memory kernels on unload |
//! | `POCKET_LLM_PROFILE_KERNELS` | false | Collect per-op kernel timings |
//! | `POCKET_LLM_SEED` | unset | Default sampling seed |
//! | `POCKET_LLM_LOG_LEVEL` | info | Log filter directive |
//! | `POCKET_LLM_LOG_FORMAT` | json | `json`, `pretty` or `compact` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::device::{precision_name, DeviceCapability, DeviceProfiler};
use crate::engine::{KernelProviderConfig, SamplingConfig};
use crate::memory::KvPrecision;
use crate::telemetry::{LogConfig, LogFormat};

/// Upper bound accepted for the context cap.
pub const MAX_CONTEXT_LIMIT: usize = 1_000_000;
/// Smallest memory budget accepted from configuration.
pub const MIN_MEMORY_BUDGET: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Kernel cache behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelCacheConfig {
    pub lock_wait_ms: u64,
    pub lock_stale_secs: u64,
    pub persist: bool,
}

impl Default for KernelCacheConfig {
    fn default() -> Self {
        let d = KernelProviderConfig::default();
        Self {
            lock_wait_ms: d.lock_wait.as_millis() as u64,
            lock_stale_secs: d.lock_stale_after.as_secs(),
            persist: d.persist,
        }
    }
}

impl KernelCacheConfig {
    pub fn provider_config(&self) -> KernelProviderConfig {
        KernelProviderConfig {
            lock_wait: Duration::from_millis(self.lock_wait_ms),
            lock_stale_after: Duration::from_secs(self.lock_stale_secs.max(1)),
            persist: self.persist,
        }
    }
}

/// Everything an [`Engine`](crate::engine::Engine) is constructed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Arena budget override in bytes. Probed from the device when unset.
    pub memory_budget: Option<u64>,
    /// Key/value precision override.
    pub precision: Option<KvPrecision>,
    /// Cap applied to the model's declared context length.
    pub max_context: Option<usize>,
    pub kernel_cache: KernelCacheConfig,
    pub flush_kernels_on_unload: bool,
    pub profile_kernels: bool,
    /// Sampling used by [`Engine::generate`](crate::engine::Engine::generate).
    pub sampling: SamplingConfig,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_budget: None,
            precision: None,
            max_context: None,
            kernel_cache: KernelCacheConfig::default(),
            flush_kernels_on_unload: false,
            profile_kernels: false,
            sampling: SamplingConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`1/0`, `true/false`, `yes/no`, `on/off`).
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_precision(s: &str) -> Option<KvPrecision> {
    match s.trim().to_ascii_lowercase().as_str() {
        "f32" | "fp32" => Some(KvPrecision::F32),
        "f16" | "fp16" => Some(KvPrecision::F16),
        _ => None,
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Layer `POCKET_LLM_*` overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("POCKET_LLM_MEMORY_BUDGET") {
            if let Ok(bytes) = v.trim().parse::<u64>() {
                self.memory_budget = Some(bytes.max(MIN_MEMORY_BUDGET));
            }
        }
        if let Ok(v) = std::env::var("POCKET_LLM_PRECISION") {
            if let Some(p) = parse_precision(&v) {
                self.precision = Some(p);
            }
        }
        let ctx = parse_usize("POCKET_LLM_MAX_CONTEXT", 0);
        if ctx > 0 {
            self.max_context = Some(ctx.min(MAX_CONTEXT_LIMIT));
        }

        let kc = &mut self.kernel_cache;
        kc.lock_wait_ms = parse_u64("POCKET_LLM_KERNEL_LOCK_WAIT_MS", kc.lock_wait_ms);
        kc.lock_stale_secs = parse_u64("POCKET_LLM_KERNEL_LOCK_STALE_SECS", kc.lock_stale_secs).max(1);
        kc.persist = parse_bool("POCKET_LLM_PERSIST_KERNELS", kc.persist);

        self.flush_kernels_on_unload = parse_bool("POCKET_LLM_FLUSH_KERNELS", self.flush_kernels_on_unload);
        self.profile_kernels = parse_bool("POCKET_LLM_PROFILE_KERNELS", self.profile_kernels);

        if let Ok(v) = std::env::var("POCKET_LLM_SEED") {
            if let Ok(seed) = v.trim().parse::<u64>() {
                self.sampling.seed = Some(seed);
            }
        }
        if let Ok(level) = std::env::var("POCKET_LLM_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log.level = level.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("POCKET_LLM_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&v) {
                self.log.format = format;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(budget) = self.memory_budget {
            if budget < MIN_MEMORY_BUDGET {
                return Err(ConfigError::Invalid(format!(
                    "memory_budget {} is below the {} byte minimum",
                    budget, MIN_MEMORY_BUDGET
                )));
            }
        }
        if let Some(ctx) = self.max_context {
            if ctx == 0 || ctx > MAX_CONTEXT_LIMIT {
                return Err(ConfigError::Invalid(format!(
                    "max_context must be in 1..={}",
                    MAX_CONTEXT_LIMIT
                )));
            }
        }
        self.sampling
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The probed device with this config's overrides applied.
    pub fn capability(&self) -> DeviceCapability {
        let mut cap = DeviceProfiler::capability().clone();
        if let Some(bytes) = self.memory_budget {
            cap = cap.with_memory_budget(bytes);
        }
        if let Some(p) = self.precision {
            cap = cap.with_precision(p);
        }
        cap
    }

    /// Serializable summary of the values in effect.
    pub fn effective_config(&self) -> EffectiveConfig {
        let cap = self.capability();
        EffectiveConfig {
            memory_budget: cap.memory_budget,
            precision: precision_name(cap.precision),
            accelerator: cap.family.to_string(),
            max_context: self.max_context,
            kernel_lock_wait_ms: self.kernel_cache.lock_wait_ms,
            kernel_lock_stale_secs: self.kernel_cache.lock_stale_secs,
            persist_kernels: self.kernel_cache.persist,
            flush_kernels_on_unload: self.flush_kernels_on_unload,
            profile_kernels: self.profile_kernels,
            sampling: self.sampling.clone(),
            log_level: self.log.level.clone(),
            log_format: self.log.format,
        }
    }
}

/// Load configuration: defaults, then `path` if given, then the environment.
pub fn load(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let base = match path {
        Some(p) => EngineConfig::from_file(p)?,
        None => EngineConfig::default(),
    };
    let cfg = base.with_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

/// Effective configuration summary.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub memory_budget: u64,
    pub precision: &'static str,
    pub accelerator: String,
    pub max_context: Option<usize>,
    pub kernel_lock_wait_ms: u64,
    pub kernel_lock_stale_secs: u64,
    pub persist_kernels: bool,
    pub flush_kernels_on_unload: bool,
    pub profile_kernels: bool,
    pub sampling: SamplingConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Serializes tests that read or mutate `POCKET_LLM_*` variables.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
