// Copyright 2024-2026 pocket-llm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! `--config FILE` selects a TOML file; `POCKET_LLM_*` variables apply on
//! top either way.

use std::path::Path;

use crate::config::{self, EffectiveConfig, EngineConfig};

fn config_path(args: &[String]) -> Option<&Path> {
    super::flag_value(args, "--config").map(Path::new)
}

/// Print effective config as key-value pairs to stdout.
pub fn run_show(args: &[String]) -> i32 {
    match config::load(config_path(args)) {
        Ok(cfg) => {
            print_config(&cfg.effective_config());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Print default config values (no file, no env overrides) to stdout.
pub fn run_defaults() {
    print_config(&EngineConfig::default().effective_config());
}

/// Validate configuration and flag settings that load but are unlikely to
/// work.
///
/// Returns 0 if valid, 1 on an error or any warning.
pub fn run_validate(args: &[String]) -> i32 {
    let cfg = match config::load(config_path(args)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return 1;
        }
    };
    let eff = cfg.effective_config();
    let mut warnings = 0;

    if eff.memory_budget < 64 * 1024 * 1024 {
        eprintln!(
            "WARNING: POCKET_LLM_MEMORY_BUDGET ({}) leaves little room for weights and cache",
            eff.memory_budget
        );
        warnings += 1;
    }

    if !eff.persist_kernels && eff.flush_kernels_on_unload {
        eprintln!("WARNING: kernels are neither persisted nor kept in memory; every load recompiles");
        warnings += 1;
    }

    if warnings == 0 {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn print_config(cfg: &EffectiveConfig) {
    println!("POCKET_LLM_ACCELERATOR={}", cfg.accelerator);
    println!("POCKET_LLM_MEMORY_BUDGET={}", cfg.memory_budget);
    println!("POCKET_LLM_PRECISION={}", cfg.precision);
    match cfg.max_context {
        Some(ctx) => println!("POCKET_LLM_MAX_CONTEXT={}", ctx),
        None => println!("POCKET_LLM_MAX_CONTEXT="),
    }
    println!("POCKET_LLM_KERNEL_LOCK_WAIT_MS={}", cfg.kernel_lock_wait_ms);
    println!("POCKET_LLM_KERNEL_LOCK_STALE_SECS={}", cfg.kernel_lock_stale_secs);
    println!("POCKET_LLM_PERSIST_KERNELS={}", cfg.persist_kernels);
    println!("POCKET_LLM_FLUSH_KERNELS={}", cfg.flush_kernels_on_unload);
    println!("POCKET_LLM_PROFILE_KERNELS={}", cfg.profile_kernels);
    match cfg.sampling.seed {
        Some(seed) => println!("POCKET_LLM_SEED={}", seed),
        None => println!("POCKET_LLM_SEED="),
    }
    println!("POCKET_LLM_LOG_LEVEL={}", cfg.log_level);
    println!("POCKET_LLM_LOG_FORMAT={}", cfg.log_format.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env_lock;

    const ENV_KEYS: &[&str] = &[
        "POCKET_LLM_MEMORY_BUDGET",
        "POCKET_LLM_PRECISION",
        "POCKET_LLM_MAX_CONTEXT",
        "POCKET_LLM_PERSIST_KERNELS",
        "POCKET_LLM_FLUSH_KERNELS",
        "POCKET_LLM_SEED",
        "POCKET_LLM_LOG_LEVEL",
        "POCKET_LLM_LOG_FORMAT",
    ];

    fn clear_env() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_passes_with_roomy_budget() {
        let _lock = env_lock();
        clear_env();
        std::env::set_var("POCKET_LLM_MEMORY_BUDGET", "1073741824");
        assert_eq!(run_validate(&[]), 0);
        clear_env();
    }

    #[test]
    fn test_validate_warns_on_tiny_budget() {
        let _lock = env_lock();
        clear_env();
        std::env::set_var("POCKET_LLM_MEMORY_BUDGET", "2097152");
        assert_eq!(run_validate(&[]), 1);
        clear_env();
    }

    #[test]
    fn test_validate_warns_when_kernels_never_kept() {
        let _lock = env_lock();
        clear_env();
        std::env::set_var("POCKET_LLM_MEMORY_BUDGET", "1073741824");
        std::env::set_var("POCKET_LLM_PERSIST_KERNELS", "false");
        std::env::set_var("POCKET_LLM_FLUSH_KERNELS", "true");
        assert_eq!(run_validate(&[]), 1);
        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_file() {
        let _lock = env_lock();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "memory_budget = 12\n").unwrap();
        let a = args(&["--config", path.to_str().unwrap()]);
        assert_eq!(run_validate(&a), 1);
        assert_eq!(run_show(&a), 1);
    }

    #[test]
    fn test_missing_file_fails_show() {
        let _lock = env_lock();
        clear_env();
        assert_eq!(run_show(&args(&["--config", "/nonexistent/pocket.toml"])), 1);
    }

    #[test]
    fn test_print_config_smoke() {
        let _lock = env_lock();
        clear_env();
        run_defaults();
        assert_eq!(run_show(&[]), 0);
    }
}
