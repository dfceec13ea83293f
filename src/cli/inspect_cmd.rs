// Copyright 2024-2026 pocket-llm Contributors
// SPDX-License-Identifier: Apache-2.0

//! `inspect` subcommand: summarize a model container without loading it
//! into an engine.

use std::path::Path;

use serde::Serialize;

use crate::models::{ContainerError, GgmlType, ModelContainer, ModelHparams};

#[derive(Debug, Serialize)]
struct TensorRow {
    name: String,
    dims: Vec<u64>,
    ty: GgmlType,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct Inspection {
    name: String,
    gguf_version: u32,
    file_bytes: usize,
    metadata_entries: usize,
    hparams: ModelHparams,
    bos: u32,
    eos: u32,
    tensors: Vec<TensorRow>,
}

fn inspect(path: &Path) -> Result<Inspection, ContainerError> {
    let model = ModelContainer::open(path)?;
    let gguf = model.gguf();
    let special = &model.vocab().special;
    Ok(Inspection {
        name: model.name(),
        gguf_version: gguf.version,
        file_bytes: model.file_len(),
        metadata_entries: gguf.metadata_len(),
        hparams: model.hparams().clone(),
        bos: special.bos,
        eos: special.eos,
        tensors: gguf
            .tensors()
            .iter()
            .map(|t| TensorRow {
                name: t.name.clone(),
                dims: t.dims.clone(),
                ty: t.ty,
                bytes: t.byte_len,
            })
            .collect(),
    })
}

/// `inspect MODEL [--json] [--tensors]`
pub fn run_inspect(args: &[String]) -> i32 {
    let Some(path) = super::positional(args, 2) else {
        eprintln!("Error: model path required");
        eprintln!("Usage: pocket-llm-cli inspect MODEL [--json] [--tensors]");
        return 2;
    };
    let report = match inspect(Path::new(path)) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    if super::has_flag(args, "--json") {
        return match serde_json::to_string_pretty(&report) {
            Ok(s) => {
                println!("{}", s);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        };
    }

    let hp = &report.hparams;
    println!("Model:        {}", report.name);
    println!("GGUF:         v{} ({} metadata entries)", report.gguf_version, report.metadata_entries);
    println!("Size:         {:.1} MiB", report.file_bytes as f64 / (1024.0 * 1024.0));
    println!("Architecture: {}", hp.architecture);
    println!("Weights:      {}", hp.quantization);
    println!("Layers:       {}", hp.n_layers);
    println!("Hidden:       {} ({} heads, {} kv heads)", hp.hidden, hp.n_heads, hp.n_kv_heads);
    println!("FFN:          {}", hp.ffn_hidden);
    println!("Context:      {}", hp.context_length);
    println!("Vocabulary:   {} (bos {}, eos {})", hp.vocab_size, report.bos, report.eos);
    println!("Tensors:      {}", report.tensors.len());

    if super::has_flag(args, "--tensors") {
        println!();
        for t in &report.tensors {
            let dims: Vec<String> = t.dims.iter().map(u64::to_string).collect();
            println!("  {:<32} {:>6} [{}] {} bytes", t.name, t.ty.name(), dims.join(" x "), t.bytes);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SynthConfig;

    #[test]
    fn inspect_reports_synthetic_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        SynthConfig::default().write_to(&path).unwrap();

        let report = inspect(&path).unwrap();
        assert_eq!(report.name, "pocket-synth");
        assert_eq!(report.hparams.n_layers, 2);
        assert_eq!(report.bos, 1);
        assert!(report.tensors.iter().any(|t| t.name == "token_embd.weight"));

        let args: Vec<String> = ["cli", "inspect", path.to_str().unwrap(), "--tensors"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(run_inspect(&args), 0);
    }

    #[test]
    fn inspect_missing_file_fails() {
        let args: Vec<String> = ["cli", "inspect", "/nonexistent/model.gguf"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(run_inspect(&args), 1);
        assert_eq!(run_inspect(&["cli".to_string(), "inspect".to_string()]), 2);
    }
}
