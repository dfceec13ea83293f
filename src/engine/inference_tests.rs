//! Engine facade state machine tests.

use super::*;
use crate::engine::{FinishReason, SamplingConfig};
use crate::models::SynthConfig;

fn test_config() -> EngineConfig {
    EngineConfig {
        memory_budget: Some(256 * 1024 * 1024),
        sampling: SamplingConfig::greedy(),
        ..Default::default()
    }
}

fn write_model(dir: &Path) -> PathBuf {
    let path = dir.join("tiny.gguf");
    SynthConfig::default().write_to(&path).unwrap();
    path
}

fn loaded_engine(dir: &Path) -> Engine {
    let engine = Engine::new(test_config());
    let model = write_model(dir);
    engine.load(&model, &dir.join("kernels")).unwrap();
    engine
}

#[test]
fn new_engine_is_unloaded_and_reports_device() {
    let engine = Engine::new(test_config());
    assert_eq!(engine.state(), EngineState::Unloaded);
    assert!(engine.model_info().is_none());
    let info = engine.device_info();
    assert!(info.contains("Accelerator:"));
    assert!(info.contains("Engine state: unloaded"));
    assert_eq!(engine.arena_usage().used, 0);
}

#[test]
fn load_populates_model_info_and_arena() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    assert_eq!(engine.state(), EngineState::Ready);

    let info = engine.model_info().unwrap();
    assert_eq!(info.name, "pocket-synth");
    assert_eq!(info.n_layers, 2);
    assert_eq!(info.kernel_source, KernelSource::Compiled);

    let usage = engine.arena_usage();
    assert!(usage.weights > 0);
    assert!(usage.activations > 0);
    assert!(usage.kv_cache > 0);
    assert_eq!(usage.session, 0);
}

#[test]
fn second_load_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    let model = dir.path().join("tiny.gguf");
    let err = engine.load(&model, dir.path()).unwrap_err();
    assert!(matches!(err, EngineError::AlreadyLoaded));
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn calls_during_generation_are_busy() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    engine.slot.lock().state = EngineState::Generating;

    assert!(matches!(engine.generate("hi", 1), Err(EngineError::Busy(EngineState::Generating))));
    assert!(matches!(engine.unload(), Err(EngineError::Busy(_))));
    let model = dir.path().join("tiny.gguf");
    assert!(matches!(engine.load(&model, dir.path()), Err(EngineError::Busy(_))));

    engine.slot.lock().state = EngineState::Ready;
    assert!(engine.unload().is_ok());
}

#[test]
fn generate_before_load_is_not_ready() {
    let engine = Engine::new(test_config());
    let err = engine.generate("hello", 4).unwrap_err();
    assert!(matches!(err, EngineError::NotReady(EngineState::Unloaded)));
    let text = engine.generate_text("hello", 4);
    assert!(text.starts_with(ERROR_PREFIX));
    assert!(text.contains("NotReadyError"));
}

#[test]
fn unload_releases_everything_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    engine.generate("hello world", 3).unwrap();

    engine.unload().unwrap();
    assert_eq!(engine.state(), EngineState::Unloaded);
    assert_eq!(engine.arena_usage().used, 0);
    assert_eq!(engine.arena_usage().live, 0);
    assert!(engine.model_info().is_none());

    engine.unload().unwrap();
    assert_eq!(engine.state(), EngineState::Unloaded);
}

#[test]
fn generation_returns_model_to_slot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    let out = engine.generate("once upon a time", 5).unwrap();
    assert!(out.tokens.len() <= 5);
    assert_eq!(engine.state(), EngineState::Ready);
    assert!(engine.slot.lock().model.is_some());
    assert_eq!(engine.arena_usage().session, 0);
}

#[test]
fn invalid_sampling_leaves_engine_ready() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    let params = GenerationParams::new(
        4,
        SamplingConfig {
            top_p: 0.0,
            ..SamplingConfig::default()
        },
    );
    let err = engine
        .generate_with("hello", params, |_| ControlFlow::Continue(()))
        .unwrap_err();
    assert_eq!(err.kind(), crate::engine::ErrorKind::InvalidInput);
    assert_eq!(engine.state(), EngineState::Ready);
    assert!(engine.last_error().is_some());
}

#[test]
fn callback_break_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    let params = GenerationParams {
        ignore_eos: true,
        ..GenerationParams::greedy(16)
    };
    let out = engine
        .generate_with("hello", params, |ev| {
            if ev.index == 1 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
    assert_eq!(out.finish_reason, FinishReason::Cancelled);
    assert_eq!(out.tokens.len(), 2);
}

#[test]
fn cancel_seen_as_generating_is_not_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let engine = loaded_engine(dir.path());
    engine.cancel();

    let (model, _) = engine.begin_generation().unwrap();
    assert!(!engine.cancel.is_cancelled());
    assert_eq!(engine.state(), EngineState::Generating);
    engine.cancel();
    assert!(engine.cancel.is_cancelled());

    {
        let mut slot = engine.slot.lock();
        slot.model = Some(model);
        slot.state = EngineState::Ready;
    }
    // The next generation starts clean.
    let out = engine.generate("hello", 3).unwrap();
    assert_ne!(out.finish_reason, FinishReason::Cancelled);
}

#[test]
fn failed_load_releases_arena() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.gguf");
    let mut bytes = SynthConfig::default().writer().unwrap().to_bytes();
    bytes.truncate(bytes.len() - 100);
    std::fs::write(&path, bytes).unwrap();

    let engine = Engine::new(test_config());
    assert!(!engine.load_model(path.to_str().unwrap(), dir.path().to_str().unwrap()));
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(engine.arena_usage().used, 0);
    assert!(engine.last_error().unwrap().to_lowercase().contains("truncated"));

    // Failed is retryable.
    let good = write_model(dir.path());
    engine.load(&good, dir.path()).unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn flush_on_unload_drops_kernel_memo() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig {
        flush_kernels_on_unload: true,
        ..test_config()
    });
    let model = write_model(dir.path());
    engine.load(&model, dir.path()).unwrap();
    assert_eq!(engine.kernels.memo_len(), 1);
    engine.unload().unwrap();
    assert_eq!(engine.kernels.memo_len(), 0);
}
