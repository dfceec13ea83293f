//! Metric names and recording helpers over the `metrics` facade.
//!
//! Without an installed recorder every call is a no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

pub const ARENA_USED_BYTES: &str = "pocket_llm_arena_used_bytes";
pub const ARENA_BUDGET_BYTES: &str = "pocket_llm_arena_budget_bytes";
pub const KERNEL_CACHE_TOTAL: &str = "pocket_llm_kernel_cache_total";
pub const LOADS_TOTAL: &str = "pocket_llm_loads_total";
pub const LOAD_SECONDS: &str = "pocket_llm_load_seconds";
pub const UNLOADS_TOTAL: &str = "pocket_llm_unloads_total";
pub const GENERATIONS_TOTAL: &str = "pocket_llm_generations_total";
pub const TOKENS_GENERATED_TOTAL: &str = "pocket_llm_tokens_generated_total";
pub const GENERATION_SECONDS: &str = "pocket_llm_generation_seconds";
pub const DECODE_TOKENS_PER_SECOND: &str = "pocket_llm_decode_tokens_per_second";

/// Register descriptions with the installed recorder. Safe to call repeatedly.
pub fn init_metrics() {
    describe_gauge!(ARENA_USED_BYTES, Unit::Bytes, "Bytes charged to the arena");
    describe_gauge!(ARENA_BUDGET_BYTES, Unit::Bytes, "Arena budget");
    describe_counter!(KERNEL_CACHE_TOTAL, "Kernel set lookups by outcome");
    describe_counter!(LOADS_TOTAL, "Model loads by outcome");
    describe_histogram!(LOAD_SECONDS, Unit::Seconds, "Model load duration");
    describe_counter!(UNLOADS_TOTAL, "Model unloads");
    describe_counter!(GENERATIONS_TOTAL, "Generate calls by finish reason");
    describe_counter!(TOKENS_GENERATED_TOTAL, "Tokens produced by the decode loop");
    describe_histogram!(GENERATION_SECONDS, Unit::Seconds, "End-to-end generate duration");
    describe_gauge!(DECODE_TOKENS_PER_SECOND, "Decode throughput of the last generation");
}

pub fn record_arena_usage(used: usize, budget: usize) {
    gauge!(ARENA_USED_BYTES).set(used as f64);
    gauge!(ARENA_BUDGET_BYTES).set(budget as f64);
}

/// `outcome` is one of "memory", "disk", "compiled" or "corrupt".
pub fn record_kernel_cache(outcome: &'static str) {
    counter!(KERNEL_CACHE_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_load(elapsed: Duration) {
    counter!(LOADS_TOTAL, "outcome" => "ok").increment(1);
    histogram!(LOAD_SECONDS).record(elapsed.as_secs_f64());
}

pub fn record_load_failure(kind: &'static str) {
    counter!(LOADS_TOTAL, "outcome" => "error", "kind" => kind).increment(1);
}

pub fn record_unload() {
    counter!(UNLOADS_TOTAL).increment(1);
}

pub fn record_generation(finish: &'static str, tokens: usize, elapsed: Duration, decode_tps: f64) {
    counter!(GENERATIONS_TOTAL, "finish" => finish).increment(1);
    counter!(TOKENS_GENERATED_TOTAL).increment(tokens as u64);
    histogram!(GENERATION_SECONDS).record(elapsed.as_secs_f64());
    gauge!(DECODE_TOKENS_PER_SECOND).set(decode_tps);
}

pub fn record_generation_failure(kind: &'static str, tokens: usize) {
    counter!(GENERATIONS_TOTAL, "finish" => "error", "kind" => kind).increment(1);
    counter!(TOKENS_GENERATED_TOTAL).increment(tokens as u64);
}
