// Copyright 2024-2026 pocket-llm Contributors
// SPDX-License-Identifier: Apache-2.0

//! `generate` and `bench` subcommands.
//!
//! Both build an [`Engine`] in-process, load the model, and drive the
//! generation loop directly.

use std::io::Write;
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Instant;

use super::{cache_dir, flag_value, has_flag, parse_flag};
use crate::config::{self, EngineConfig};
use crate::engine::{Engine, GenerationOutput, GenerationParams};

/// Config from `--config` and the environment, with sampling flags on top.
fn engine_config(args: &[String]) -> Result<EngineConfig, String> {
    let mut cfg = config::load(flag_value(args, "--config").map(Path::new)).map_err(|e| e.to_string())?;
    let s = &mut cfg.sampling;
    s.temperature = parse_flag(args, "--temperature", s.temperature)?;
    s.top_k = parse_flag(args, "--top-k", s.top_k)?;
    s.top_p = parse_flag(args, "--top-p", s.top_p)?;
    if let Some(seed) = flag_value(args, "--seed") {
        s.seed = Some(seed.parse().map_err(|_| format!("invalid value for --seed: {}", seed))?);
    }
    if has_flag(args, "--greedy") {
        s.temperature = 0.0;
    }
    if has_flag(args, "--profile") {
        cfg.profile_kernels = true;
    }
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

fn load_engine(args: &[String]) -> Result<Engine, String> {
    let model = flag_value(args, "--model").ok_or("--model PATH is required")?;
    let engine = Engine::new(engine_config(args)?);
    engine
        .load(Path::new(model), &cache_dir(args))
        .map_err(|e| format!("{}: {}", e.kind(), e))?;
    Ok(engine)
}

fn print_stats(out: &GenerationOutput) {
    let s = &out.stats;
    eprintln!(
        "\n[{}] {} prompt tokens in {:.1} ms ({:.1} tok/s), {} generated in {:.1} ms ({:.1} tok/s)",
        out.finish_reason.name(),
        s.prompt_tokens,
        s.prefill.as_secs_f64() * 1000.0,
        s.prefill_tokens_per_sec(),
        s.generated_tokens,
        s.decode.as_secs_f64() * 1000.0,
        s.decode_tokens_per_sec()
    );
    for t in &s.kernels {
        if t.calls > 0 {
            eprintln!("  {:<12} {:>8} calls {:>10.3} ms", t.op.to_string(), t.calls, t.total.as_secs_f64() * 1000.0);
        }
    }
}

/// `generate --model PATH [--prompt TEXT] [--max-tokens N] [--stream] [--json] ...`
pub fn run_generate(args: &[String]) -> i32 {
    let engine = match load_engine(args) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let prompt = flag_value(args, "--prompt").unwrap_or("");
    let max_tokens = match parse_flag(args, "--max-tokens", 64usize) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    let stream = has_flag(args, "--stream");
    let params = GenerationParams::new(max_tokens, engine.config().sampling.clone());

    if stream {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
    }
    let result = engine.generate_with(prompt, params, |ev| {
        if stream {
            print!("{}", ev.text);
            let _ = std::io::stdout().flush();
        }
        ControlFlow::Continue(())
    });

    let code = match result {
        Ok(out) => {
            if has_flag(args, "--json") {
                match serde_json::to_string_pretty(&out) {
                    Ok(s) => println!("{}", s),
                    Err(e) => eprintln!("Error: {}", e),
                }
            } else if stream {
                println!();
            } else {
                println!("{}", out.full_text());
            }
            if stream || has_flag(args, "--profile") {
                print_stats(&out);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}: {}", e.kind(), e);
            1
        }
    };
    let _ = engine.unload();
    code
}

/// `bench --model PATH [--runs N] [--max-tokens N] [--prompt TEXT]`
///
/// Runs greedy generations that ignore end-of-sequence so every run decodes
/// the same number of tokens.
pub fn run_bench(args: &[String]) -> i32 {
    let load_start = Instant::now();
    let engine = match load_engine(args) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let load_ms = load_start.elapsed().as_secs_f64() * 1000.0;
    let (runs, max_tokens) = match (parse_flag(args, "--runs", 3usize), parse_flag(args, "--max-tokens", 32usize)) {
        (Ok(r), Ok(m)) => (r.max(1), m),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    let prompt = flag_value(args, "--prompt").unwrap_or("once upon a time");

    if let Some(info) = engine.model_info() {
        println!(
            "Model: {} ({}, {} layers), kernels: {:?}, load {:.1} ms",
            info.name, info.quantization, info.n_layers, info.kernel_source, load_ms
        );
    }

    let mut prefill = Vec::with_capacity(runs);
    let mut decode = Vec::with_capacity(runs);
    for run in 0..runs {
        let params = GenerationParams {
            ignore_eos: true,
            ..GenerationParams::greedy(max_tokens)
        };
        match engine.generate_with(prompt, params, |_| ControlFlow::Continue(())) {
            Ok(out) => {
                let s = &out.stats;
                println!(
                    "run {}: prefill {:.1} tok/s, decode {:.1} tok/s ({} tokens, {})",
                    run + 1,
                    s.prefill_tokens_per_sec(),
                    s.decode_tokens_per_sec(),
                    s.generated_tokens,
                    out.finish_reason.name()
                );
                prefill.push(s.prefill_tokens_per_sec());
                decode.push(s.decode_tokens_per_sec());
            }
            Err(e) => {
                eprintln!("Error: {}: {}", e.kind(), e);
                return 1;
            }
        }
    }
    println!(
        "median: prefill {:.1} tok/s, decode {:.1} tok/s, arena peak {} bytes",
        median(&mut prefill),
        median(&mut decode),
        engine.arena_usage().peak
    );
    0
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SynthConfig;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn median_of_unsorted() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut []), 0.0);
    }

    #[test]
    fn generate_requires_model() {
        let _lock = crate::config::env_lock();
        assert_eq!(run_generate(&args(&["cli", "generate", "--prompt", "hi"])), 1);
    }

    #[test]
    fn sampling_flags_apply() {
        let _lock = crate::config::env_lock();
        let a = args(&["cli", "generate", "--greedy", "--seed", "7", "--top-k", "5"]);
        let cfg = engine_config(&a).unwrap();
        assert_eq!(cfg.sampling.temperature, 0.0);
        assert_eq!(cfg.sampling.seed, Some(7));
        assert_eq!(cfg.sampling.top_k, 5);
        assert!(engine_config(&args(&["--top-p", "2.0"])).is_err());
    }

    #[test]
    fn generate_and_bench_on_synthetic_model() {
        let _lock = crate::config::env_lock();
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("tiny.gguf");
        SynthConfig::default().write_to(&model).unwrap();
        let m = model.to_str().unwrap();
        let cache = dir.path().join("k");
        let c = cache.to_str().unwrap();

        let gen = args(&["cli", "generate", "--model", m, "--cache-dir", c, "--prompt", "hello", "--max-tokens", "4", "--greedy"]);
        assert_eq!(run_generate(&gen), 0);

        let bench = args(&["cli", "bench", "--model", m, "--cache-dir", c, "--runs", "2", "--max-tokens", "3"]);
        assert_eq!(run_bench(&bench), 0);
    }
}
