//! pocket-llm command-line entry point.
//!
//! ## CLI Subcommands
//!
//! - `pocket-llm-cli device` - Probed accelerator capability
//! - `pocket-llm-cli inspect MODEL` - Container summary
//! - `pocket-llm-cli synth --out FILE` - Write a tiny random model
//! - `pocket-llm-cli generate --model MODEL` - Run generation
//! - `pocket-llm-cli bench --model MODEL` - Measure throughput
//! - `pocket-llm-cli config` - Show or validate configuration

use std::process::ExitCode;

use pocket_llm::cli::{self, config_cmd, generate_cmd, inspect_cmd};
use pocket_llm::telemetry::{init_logging, init_metrics, LogConfig, LogFormat};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    init_cli_logging(&args);
    init_metrics();

    match command {
        "device" => exit(cli::run_device(&args)),
        "inspect" => exit(inspect_cmd::run_inspect(&args)),
        "synth" => exit(cli::run_synth(&args)),
        "generate" | "gen" => exit(generate_cmd::run_generate(&args)),
        "bench" => exit(generate_cmd::run_bench(&args)),
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => exit(config_cmd::run_show(&args)),
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => exit(config_cmd::run_validate(&args)),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("pocket-llm {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

/// Compact warnings on stderr unless the environment asks for more.
fn init_cli_logging(args: &[String]) {
    let mut log = LogConfig {
        format: LogFormat::Compact,
        level: "warn".to_string(),
        output_path: None,
    };
    if let Ok(level) = std::env::var("POCKET_LLM_LOG_LEVEL") {
        log.level = level;
    }
    if let Some(format) = std::env::var("POCKET_LLM_LOG_FORMAT")
        .ok()
        .and_then(|v| LogFormat::parse(&v))
    {
        log.format = format;
    }
    if cli::has_flag(args, "--verbose") || cli::has_flag(args, "-v") {
        log.level = "pocket_llm=debug".to_string();
    }
    if let Err(e) = init_logging(&log) {
        eprintln!("Warning: logging disabled: {}", e);
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "pocket-llm - on-device LLM inference v{}

USAGE:
    pocket-llm-cli <COMMAND> [OPTIONS]

COMMANDS:
    device       Show the probed accelerator capability
    inspect      Summarize a GGUF model file
    synth        Write a tiny random llama model for smoke tests
    generate     Generate text from a prompt
    bench        Measure prefill and decode throughput
    config       Show, validate or print default configuration
    version      Show version information
    help         Show this help message

OPTIONS:
    -h, --help     Show help for command
    -V, --version  Show version information
    -v, --verbose  Enable debug logging

EXAMPLES:
    pocket-llm-cli device
    pocket-llm-cli synth --out tiny.gguf
    pocket-llm-cli inspect tiny.gguf --tensors
    pocket-llm-cli generate --model tiny.gguf --prompt \"Hello\" --stream
    pocket-llm-cli bench --model tiny.gguf --runs 5
    pocket-llm-cli config validate --config pocket.toml

ENVIRONMENT:
    POCKET_LLM_CACHE_DIR   Kernel cache directory (default: <tmp>/pocket-llm-kernels)
    POCKET_LLM_LOG_LEVEL   Log filter directive (default for the CLI: warn)
    POCKET_LLM_LOG_FORMAT  json, pretty or compact
    See `pocket-llm-cli config defaults` for the remaining POCKET_LLM_* settings.

EXIT CODES:
    0  Success
    1  Failure
    2  Usage error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "device" => {
            eprintln!(
                "pocket-llm-cli device - Show accelerator capability

USAGE:
    pocket-llm-cli device [--json]

DESCRIPTION:
    Probes the host once and prints the accelerator family, compute units,
    memory budget, preferred precision and the fingerprint that keys the
    kernel cache.
"
            );
        }
        "inspect" => {
            eprintln!(
                "pocket-llm-cli inspect - Summarize a model file

USAGE:
    pocket-llm-cli inspect MODEL [--json] [--tensors]

OPTIONS:
    --json      Print the summary as JSON
    --tensors   List every tensor with its shape and encoding
"
            );
        }
        "synth" => {
            eprintln!(
                "pocket-llm-cli synth - Write a synthetic model

USAGE:
    pocket-llm-cli synth --out FILE [OPTIONS]

OPTIONS:
    --type T        f32, f16, q8_0 or q4_0 (default: q8_0)
    --layers N      Decoder layers (default: 2)
    --hidden N      Hidden size, a multiple of 32 (default: 64)
    --heads N       Attention heads (default: 4)
    --kv-heads N    Key/value heads (default: 2)
    --ffn N         Feed-forward size (default: 2 x hidden)
    --context N     Context length (default: 128)
    --seed N        Weight seed
    --tied          Tie the output head to the embedding
    --sidecar-vocab Write tokenizer tables to FILE.vocab instead of the model
"
            );
        }
        "generate" | "gen" => {
            eprintln!(
                "pocket-llm-cli generate - Generate text

USAGE:
    pocket-llm-cli generate --model MODEL [OPTIONS]

OPTIONS:
    --prompt TEXT      Prompt (default: empty)
    --max-tokens N     Maximum tokens to generate (default: 64)
    --cache-dir DIR    Kernel cache directory
    --config FILE      TOML configuration file
    --temperature T    Sampling temperature
    --top-k N          Top-k limit (0 disables)
    --top-p P          Nucleus threshold
    --seed N           Sampling seed
    --greedy           Always pick the most likely token
    --stream           Print tokens as they are produced
    --profile          Report per-kernel timings
    --json             Print the full result as JSON

EXIT CODES:
    0  Generation completed (including context exhaustion)
    1  Load or generation failed
"
            );
        }
        "bench" => {
            eprintln!(
                "pocket-llm-cli bench - Measure throughput

USAGE:
    pocket-llm-cli bench --model MODEL [--runs N] [--max-tokens N] [--prompt TEXT]

DESCRIPTION:
    Loads the model once, then runs N greedy generations that ignore
    end-of-sequence and reports per-run and median tokens per second.
"
            );
        }
        "config" => {
            eprintln!(
                "pocket-llm-cli config - Configuration

USAGE:
    pocket-llm-cli config [show|defaults|validate] [--config FILE]

SUBCOMMANDS:
    show       Effective values after file and environment overrides
    defaults   Built-in defaults
    validate   Exit 1 if the configuration is invalid or suspicious
"
            );
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
        }
    }
}
