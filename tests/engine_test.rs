//! End-to-end engine behaviour on synthetic models.

mod common;

use std::ops::ControlFlow;
use std::sync::mpsc;
use std::sync::Arc;

use pocket_llm::engine::{KernelSource, ERROR_PREFIX};
use pocket_llm::models::{GgmlType, MetaValue, SynthConfig};
use pocket_llm::{
    Engine, EngineConfig, EngineError, EngineState, ErrorKind, FinishReason, GenerationParams,
};

fn run_greedy(engine: &Engine, prompt: &str, max_tokens: usize) -> Vec<u32> {
    let params = GenerationParams {
        ignore_eos: true,
        ..GenerationParams::greedy(max_tokens)
    };
    engine
        .generate_with(prompt, params, |_| ControlFlow::Continue(()))
        .unwrap()
        .tokens
}

#[test]
fn test_greedy_generation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), common::test_config());
    let a = run_greedy(&engine, "once upon a time", 8);
    let b = run_greedy(&engine, "once upon a time", 8);
    assert_eq!(a.len(), 8);
    assert_eq!(a, b);

    // A fresh engine over the same file agrees too.
    engine.unload().unwrap();
    let other = common::loaded_engine(dir.path(), common::test_config());
    assert_eq!(run_greedy(&other, "once upon a time", 8), a);
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), common::test_config());
    let params = |seed| GenerationParams {
        ignore_eos: true,
        ..GenerationParams::new(
            6,
            pocket_llm::SamplingConfig {
                temperature: 1.0,
                top_k: 20,
                top_p: 0.95,
                repetition_penalty: 1.0,
                seed: Some(seed),
            },
        )
    };
    let run = |seed| {
        engine
            .generate_with("hello", params(seed), |_| ControlFlow::Continue(()))
            .unwrap()
            .tokens
    };
    assert_eq!(run(42), run(42));
}

#[test]
fn test_every_weight_encoding_generates() {
    for ty in [GgmlType::F32, GgmlType::F16, GgmlType::Q8_0, GgmlType::Q4_0] {
        let dir = tempfile::tempdir().unwrap();
        let model = common::write_model(dir.path(), "m.gguf", &SynthConfig {
            weight_type: ty,
            tied_embeddings: ty == GgmlType::F16,
            ..SynthConfig::default()
        });
        let engine = Engine::new(common::test_config());
        engine.load(&model, dir.path()).unwrap();
        assert_eq!(engine.model_info().unwrap().quantization, ty);
        assert_eq!(run_greedy(&engine, "the device", 4).len(), 4, "{}", ty);
    }
}

#[test]
fn test_zero_max_tokens_returns_prompt_only() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), common::test_config());
    let out = engine.generate("hello world", 0).unwrap();
    assert_eq!(out.finish_reason, FinishReason::MaxTokens);
    assert!(out.tokens.is_empty());
    assert_eq!(out.full_text(), "hello world");
    assert_eq!(engine.generate_text("hello world", 0), "hello world");
}

#[test]
fn test_empty_prompt_starts_from_bos() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), common::test_config());
    let params = GenerationParams {
        ignore_eos: true,
        ..GenerationParams::greedy(3)
    };
    let out = engine
        .generate_with("", params, |_| ControlFlow::Continue(()))
        .unwrap();
    assert_eq!(out.prompt_tokens, 1);
    assert_eq!(out.tokens.len(), 3);
}

#[test]
fn test_cancelled_output_is_prefix_of_full_run() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), common::test_config());
    let full = run_greedy(&engine, "there was a small model", 10);

    let token = engine.cancel_token();
    let mut streamed = Vec::new();
    let params = GenerationParams {
        ignore_eos: true,
        ..GenerationParams::greedy(10)
    };
    let out = engine
        .generate_with("there was a small model", params, |ev| {
            streamed.push(ev.token);
            if ev.index == 3 {
                token.cancel();
            }
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(out.finish_reason, FinishReason::Cancelled);
    assert_eq!(out.tokens.len(), 4);
    assert_eq!(out.tokens, streamed);
    assert_eq!(&full[..4], &out.tokens[..]);

    // The flag is reset for the next request.
    assert_eq!(run_greedy(&engine, "there was a small model", 10), full);
}

#[test]
fn test_concurrent_generate_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(common::loaded_engine(dir.path(), common::test_config()));
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let worker = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            let params = GenerationParams {
                ignore_eos: true,
                ..GenerationParams::greedy(4)
            };
            engine
                .generate_with("hello", params, |ev| {
                    if ev.index == 0 {
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    }
                    ControlFlow::Continue(())
                })
                .unwrap()
        })
    };

    started_rx.recv().unwrap();
    assert_eq!(engine.state(), EngineState::Generating);
    let err = engine.generate("hi", 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(matches!(engine.unload(), Err(EngineError::Busy(EngineState::Generating))));
    assert!(engine.model_info().is_some());
    assert!(engine.device_info().contains("Engine state: generating"));
    release_tx.send(()).unwrap();

    let out = worker.join().unwrap();
    assert_eq!(out.tokens.len(), 4);
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn test_context_exhaustion_is_a_normal_stop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), EngineConfig {
        max_context: Some(12),
        ..common::test_config()
    });
    assert_eq!(engine.model_info().unwrap().context_length, 12);
    let params = GenerationParams {
        ignore_eos: true,
        ..GenerationParams::greedy(100)
    };
    let out = engine
        .generate_with("hello", params, |_| ControlFlow::Continue(()))
        .unwrap();
    assert_eq!(out.finish_reason, FinishReason::ContextExhausted);
    assert!(!out.tokens.is_empty());
    assert!(out.prompt_tokens + out.tokens.len() <= 13);
}

#[test]
fn test_prompt_longer_than_context_is_invalid_input() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), EngineConfig {
        max_context: Some(4),
        ..common::test_config()
    });
    let err = engine.generate("once upon a time there was a model", 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(engine.state(), EngineState::Ready);
    let text = engine.generate_text("once upon a time there was a model", 2);
    assert!(text.starts_with(ERROR_PREFIX), "{}", text);
    assert!(text.contains("InvalidInputError"));
}

#[test]
fn test_non_finite_weights_abort_without_poisoning_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SynthConfig::default();
    let mut tensors = cfg.tensors();
    let norm = tensors
        .iter_mut()
        .find(|t| t.name == "blk.0.attn_norm.weight")
        .unwrap();
    norm.values[0] = f32::NAN;
    let path = dir.path().join("nan.gguf");
    cfg.writer_with(&tensors).unwrap().write_to(&path).unwrap();

    let engine = Engine::new(common::test_config());
    engine.load(&path, dir.path()).unwrap();
    let err = engine.generate("hello", 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NumericInstability);
    assert!(matches!(err, EngineError::Aborted { tokens_generated: 0, .. }));
    assert_eq!(engine.state(), EngineState::Ready);

    // Host wrapper returns the prompt plus whatever was produced.
    assert_eq!(engine.generate_text("hello", 4), "hello");
    assert!(engine.last_error().unwrap().contains("Numeric instability"));
}

/// A model whose LM head only ever picks UTF-8 lead bytes (0xC3 or 0xE2,
/// by the sign of the first normalized hidden value), so every generation
/// stops in the middle of a character.
fn write_lead_byte_model(dir: &std::path::Path) -> std::path::PathBuf {
    let cfg = SynthConfig {
        weight_type: GgmlType::F32,
        ..SynthConfig::default()
    };
    let hidden = cfg.hidden;
    let mut tensors = cfg.tensors();
    for t in tensors.iter_mut() {
        if t.name == "output_norm.weight" {
            t.values.iter_mut().for_each(|v| *v = 0.0);
            t.values[0] = 1.0;
        } else if t.name == "output.weight" {
            t.values.iter_mut().for_each(|v| *v = 0.0);
            t.values[(3 + 0xC3) * hidden] = 1.0;
            t.values[(3 + 0xE2) * hidden] = -1.0;
        }
    }
    let path = dir.join("lead-bytes.gguf");
    cfg.writer_with(&tensors).unwrap().write_to(&path).unwrap();
    path
}

#[test]
fn test_streamed_text_adds_up_when_stopping_mid_character() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_lead_byte_model(dir.path());
    let engine = Engine::new(common::test_config());
    engine.load(&path, &dir.path().join("kernels")).unwrap();

    let mut streamed = String::new();
    let out = engine
        .generate_with("hello", GenerationParams::greedy(1), |ev| {
            streamed.push_str(&ev.text);
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(out.finish_reason, FinishReason::MaxTokens);
    assert_eq!(out.tokens.len(), 1);
    assert_eq!(out.text, "\u{FFFD}");
    assert_eq!(streamed, out.text);

    // Cancelled after the first token: the leftover byte comes in a trailing
    // event for the same index.
    let cancel = engine.cancel_token();
    let mut events = Vec::new();
    let out = engine
        .generate_with("hello", GenerationParams::greedy(5), |ev| {
            events.push((ev.index, ev.text.clone()));
            cancel.cancel();
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(out.finish_reason, FinishReason::Cancelled);
    assert_eq!(out.tokens.len(), 1);
    assert!(events.iter().all(|(index, _)| *index == 0));
    let streamed: String = events.into_iter().map(|(_, text)| text).collect();
    assert_eq!(streamed, out.text);
}

#[test]
fn test_tiny_budget_fails_load_and_releases_memory() {
    let dir = tempfile::tempdir().unwrap();
    let model = common::write_model(dir.path(), "tiny.gguf", &SynthConfig::default());
    let engine = Engine::new(EngineConfig {
        memory_budget: Some(64 * 1024),
        ..common::test_config()
    });
    let err = engine.load(&model, dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(engine.arena_usage().used, 0);
    assert!(engine.generate_text("hi", 1).contains("NotReadyError"));
}

#[test]
fn test_sidecar_vocabulary_generates_like_embedded() {
    let dir = tempfile::tempdir().unwrap();
    let embedded = common::loaded_engine(dir.path(), common::test_config());

    let split = dir.path().join("split.gguf");
    SynthConfig::default().write_with_sidecar_vocab(&split).unwrap();
    let engine = Engine::new(common::test_config());
    engine.load(&split, &dir.path().join("kernels")).unwrap();

    assert_eq!(run_greedy(&engine, "hello world", 6), run_greedy(&embedded, "hello world", 6));
}

#[test]
fn test_absurd_context_length_fails_load_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge-context.gguf");
    let mut writer = SynthConfig::default().writer().unwrap();
    writer.add_metadata("llama.context_length", MetaValue::U64(1 << 62));
    writer.write_to(&path).unwrap();

    let engine = Engine::new(common::test_config());
    let err = engine.load(&path, &dir.path().join("kernels")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(err.to_string().contains("context length"));
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(engine.arena_usage().used, 0);
}

#[test]
fn test_unsupported_file_fails_with_taxonomy_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.gguf");
    std::fs::write(&path, b"definitely not a model file").unwrap();
    let engine = Engine::new(common::test_config());
    let err = engine.load(&path, dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    let err = engine
        .load(&dir.path().join("missing.gguf"), dir.path())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(engine.state(), EngineState::Failed);
}

#[test]
fn test_second_engine_reuses_disk_kernels() {
    let dir = tempfile::tempdir().unwrap();
    let first = common::loaded_engine(dir.path(), common::test_config());
    assert_eq!(first.model_info().unwrap().kernel_source, KernelSource::Compiled);
    first.unload().unwrap();

    let second = common::loaded_engine(dir.path(), common::test_config());
    assert_eq!(second.model_info().unwrap().kernel_source, KernelSource::DiskCache);
}

#[test]
fn test_kernel_profile_reports_ops() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), EngineConfig {
        profile_kernels: true,
        ..common::test_config()
    });
    let out = engine.generate("hello", 2).unwrap();
    assert!(out.stats.kernels.iter().any(|t| t.calls > 0));
    let calls: u64 = out.stats.kernels.iter().map(|t| t.calls).sum();

    // Counters restart with each request.
    let again = engine.generate("hello", 2).unwrap();
    let calls_again: u64 = again.stats.kernels.iter().map(|t| t.calls).sum();
    assert_eq!(calls, calls_again);
}

#[test]
fn test_reload_after_unload() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::loaded_engine(dir.path(), common::test_config());
    let before = run_greedy(&engine, "pocket", 5);
    engine.unload().unwrap();
    assert_eq!(engine.state(), EngineState::Unloaded);
    engine.load(&dir.path().join("tiny.gguf"), &dir.path().join("kernels")).unwrap();
    assert_eq!(run_greedy(&engine, "pocket", 5), before);
}
