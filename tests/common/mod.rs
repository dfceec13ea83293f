//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use pocket_llm::models::SynthConfig;
use pocket_llm::{Engine, EngineConfig, SamplingConfig};

/// Roomy budget, greedy sampling, nothing from the environment.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        memory_budget: Some(256 * 1024 * 1024),
        sampling: SamplingConfig::greedy(),
        ..EngineConfig::default()
    }
}

pub fn write_model(dir: &Path, name: &str, cfg: &SynthConfig) -> PathBuf {
    let path = dir.join(name);
    cfg.write_to(&path).expect("write synthetic model");
    path
}

pub fn loaded_engine(dir: &Path, config: EngineConfig) -> Engine {
    let model = write_model(dir, "tiny.gguf", &SynthConfig::default());
    let engine = Engine::new(config);
    engine
        .load(&model, &dir.join("kernels"))
        .expect("load synthetic model");
    engine
}
