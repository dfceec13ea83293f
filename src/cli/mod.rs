// Copyright 2024-2026 pocket-llm Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for pocket-llm.
//!
//! Every command runs in-process against a local model file; nothing talks
//! to a server.
//!
//! ```bash
//! pocket-llm-cli device                                  # capability summary
//! pocket-llm-cli synth --out tiny.gguf                   # write a smoke-test model
//! pocket-llm-cli inspect tiny.gguf                       # container summary
//! pocket-llm-cli generate --model tiny.gguf --prompt "Hello"
//! pocket-llm-cli bench --model tiny.gguf --runs 5
//! ```

pub mod config_cmd;
pub mod generate_cmd;
pub mod inspect_cmd;

use std::path::PathBuf;

use crate::engine::DeviceProfiler;
use crate::models::{GgmlType, SynthConfig};

/// Value following `flag`, e.g. `--model path`.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Parse a numeric flag, falling back to `default` when absent. A present
/// but unparsable value is an error.
pub fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> Result<T, String> {
    match flag_value(args, flag) {
        Some(v) => v
            .parse()
            .map_err(|_| format!("invalid value for {}: {}", flag, v)),
        None => Ok(default),
    }
}

/// Flags that consume the following argument.
const VALUE_FLAGS: &[&str] = &[
    "--model", "--prompt", "--max-tokens", "--cache-dir", "--config", "--seed", "--temperature",
    "--top-k", "--top-p", "--runs", "--out", "--type", "--layers", "--hidden", "--heads",
    "--kv-heads", "--ffn", "--context",
];

/// First argument from `start` on that is neither a flag nor a flag's value.
pub fn positional(args: &[String], start: usize) -> Option<&str> {
    let mut i = start;
    while i < args.len() {
        let a = args[i].as_str();
        if VALUE_FLAGS.contains(&a) {
            i += 2;
        } else if a.starts_with("--") {
            i += 1;
        } else {
            return Some(a);
        }
    }
    None
}

/// Kernel cache directory: `--cache-dir`, else `POCKET_LLM_CACHE_DIR`, else
/// a directory under the system temp dir.
pub fn cache_dir(args: &[String]) -> PathBuf {
    flag_value(args, "--cache-dir")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("POCKET_LLM_CACHE_DIR").map(PathBuf::from))
        .unwrap_or_else(|| std::env::temp_dir().join("pocket-llm-kernels"))
}

/// `device [--json]`
pub fn run_device(args: &[String]) -> i32 {
    let cap = DeviceProfiler::capability();
    if has_flag(args, "--json") {
        match serde_json::to_string_pretty(cap) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        println!("{}", cap.summary());
        println!("Fingerprint: {}", cap.fingerprint());
    }
    0
}

fn parse_weight_type(s: &str) -> Option<GgmlType> {
    match s.to_ascii_lowercase().as_str() {
        "f32" => Some(GgmlType::F32),
        "f16" => Some(GgmlType::F16),
        "q8_0" | "q8" => Some(GgmlType::Q8_0),
        "q4_0" | "q4" => Some(GgmlType::Q4_0),
        _ => None,
    }
}

/// `synth --out FILE [--type q8_0] [--layers N] [--hidden N] [--seed N] [--tied]`
pub fn run_synth(args: &[String]) -> i32 {
    let Some(out) = flag_value(args, "--out") else {
        eprintln!("Error: --out FILE is required");
        return 2;
    };
    let defaults = SynthConfig::default();
    let cfg = (|| -> Result<SynthConfig, String> {
        let weight_type = match flag_value(args, "--type") {
            Some(t) => parse_weight_type(t).ok_or_else(|| format!("unsupported --type {}", t))?,
            None => defaults.weight_type,
        };
        let hidden: usize = parse_flag(args, "--hidden", defaults.hidden)?;
        let n_heads: usize = parse_flag(args, "--heads", defaults.n_heads)?;
        if hidden == 0 || hidden % 32 != 0 || n_heads == 0 || hidden % n_heads != 0 {
            return Err("--hidden must be a multiple of 32 and of --heads".into());
        }
        Ok(SynthConfig {
            n_layers: parse_flag(args, "--layers", defaults.n_layers)?,
            hidden,
            n_heads,
            n_kv_heads: parse_flag(args, "--kv-heads", defaults.n_kv_heads.min(n_heads))?,
            ffn_hidden: parse_flag(args, "--ffn", hidden * 2)?,
            context_length: parse_flag(args, "--context", defaults.context_length)?,
            weight_type,
            tied_embeddings: has_flag(args, "--tied"),
            seed: parse_flag(args, "--seed", defaults.seed)?,
            ..defaults.clone()
        })
    })();
    let cfg = match cfg {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    let path = std::path::Path::new(out);
    let written = if has_flag(args, "--sidecar-vocab") {
        cfg.write_with_sidecar_vocab(path).map(|vocab| {
            println!("Wrote vocabulary to {}", vocab.display());
        })
    } else {
        cfg.write_to(path)
    };
    match written {
        Ok(()) => {
            println!(
                "Wrote {} ({} layers, hidden {}, {} weights, vocab {})",
                out,
                cfg.n_layers,
                cfg.hidden,
                cfg.weight_type.name(),
                cfg.vocab_size()
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flag_helpers() {
        let a = args(&["cli", "generate", "--model", "m.gguf", "--stream", "--max-tokens", "12"]);
        assert_eq!(flag_value(&a, "--model"), Some("m.gguf"));
        assert_eq!(flag_value(&a, "--prompt"), None);
        assert!(has_flag(&a, "--stream"));
        assert_eq!(parse_flag(&a, "--max-tokens", 5usize), Ok(12));
        assert_eq!(parse_flag(&a, "--runs", 3usize), Ok(3));
        assert!(parse_flag::<usize>(&args(&["--runs", "x"]), "--runs", 1).is_err());
    }

    #[test]
    fn positional_skips_flags() {
        let a = args(&["cli", "inspect", "--json", "model.gguf"]);
        assert_eq!(positional(&a, 2), Some("model.gguf"));
        let a = args(&["cli", "inspect", "--config", "c.toml", "model.gguf"]);
        assert_eq!(positional(&a, 2), Some("model.gguf"));
        assert_eq!(positional(&args(&["cli", "inspect"]), 2), None);
    }

    #[test]
    fn synth_writes_a_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("s.gguf");
        let a = args(&["cli", "synth", "--out", out.to_str().unwrap(), "--type", "q4_0", "--layers", "1"]);
        assert_eq!(run_synth(&a), 0);
        let model = crate::models::ModelContainer::open(&out).unwrap();
        assert_eq!(model.hparams().n_layers, 1);
        assert_eq!(model.hparams().quantization, GgmlType::Q4_0);
    }

    #[test]
    fn synth_can_split_out_the_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("s.gguf");
        let a = args(&["cli", "synth", "--sidecar-vocab", "--out", out.to_str().unwrap()]);
        assert_eq!(run_synth(&a), 0);
        assert!(dir.path().join("s.vocab").is_file());
        let model = crate::models::ModelContainer::open(&out).unwrap();
        assert_eq!(model.vocab().len(), SynthConfig::default().vocab_size());
    }

    #[test]
    fn synth_rejects_bad_shapes() {
        let a = args(&["cli", "synth", "--out", "/tmp/never.gguf", "--hidden", "48"]);
        assert_eq!(run_synth(&a), 2);
    }
}
