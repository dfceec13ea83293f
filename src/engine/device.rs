// Copyright 2024-2026 pocket-llm Contributors
// Licensed under the Apache License, Version 2.0

//! Device profiling.
//!
//! Probes the CPU vector units, core count and available memory once per
//! process and exposes the result as a [`DeviceCapability`]. The descriptor
//! feeds kernel selection, the kernel cache key and the arena budget.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::memory::KvPrecision;

/// Fallback budget when the OS does not report available memory.
pub const DEFAULT_MEMORY_BUDGET: u64 = 2 * 1024 * 1024 * 1024;
/// Share of available memory the engine may claim.
pub const MEMORY_FRACTION: f64 = 0.75;
/// Env switch that pins the portable kernel family.
pub const FORCE_SCALAR_ENV: &str = "POCKET_LLM_FORCE_SCALAR";

/// Execution backends shipped by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcceleratorFamily {
    /// x86_64 with AVX2 and FMA.
    Avx2,
    /// aarch64 Advanced SIMD.
    Neon,
    /// Portable scalar code.
    Scalar,
}

impl Default for AcceleratorFamily {
    fn default() -> Self {
        Self::Scalar
    }
}

impl fmt::Display for AcceleratorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorFamily::Avx2 => write!(f, "AVX2"),
            AcceleratorFamily::Neon => write!(f, "NEON"),
            AcceleratorFamily::Scalar => write!(f, "Scalar"),
        }
    }
}

impl AcceleratorFamily {
    /// f32 lanes per vector register.
    pub fn lanes(self) -> usize {
        match self {
            Self::Avx2 => 8,
            Self::Neon => 4,
            Self::Scalar => 1,
        }
    }

    /// Whether this process can execute the family's kernels.
    pub fn is_supported(self) -> bool {
        match self {
            Self::Scalar => true,
            #[cfg(target_arch = "x86_64")]
            Self::Avx2 => is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
            #[cfg(target_arch = "aarch64")]
            Self::Neon => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    fn default_tile(self) -> usize {
        match self {
            Self::Avx2 => 64,
            Self::Neon => 32,
            Self::Scalar => 16,
        }
    }
}

/// What the running device can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub family: AcceleratorFamily,
    pub device_name: String,
    pub compute_units: usize,
    /// Bytes the engine may allocate.
    pub memory_budget: u64,
    /// Preferred storage precision for activations held across steps.
    pub precision: KvPrecision,
    /// Largest tile a kernel may use.
    pub max_tile: usize,
    pub simd_lanes: usize,
    pub features: Vec<String>,
    pub arch: String,
    pub os: String,
}

impl DeviceCapability {
    /// Portable descriptor used when nothing better is usable.
    pub fn scalar() -> Self {
        let family = AcceleratorFamily::Scalar;
        Self {
            family,
            device_name: format!("{} CPU", std::env::consts::ARCH),
            compute_units: num_cpus::get().max(1),
            memory_budget: DEFAULT_MEMORY_BUDGET,
            precision: KvPrecision::F32,
            max_tile: family.default_tile(),
            simd_lanes: family.lanes(),
            features: Vec::new(),
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }

    /// Override the memory budget.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Override the preferred precision.
    pub fn with_precision(mut self, precision: KvPrecision) -> Self {
        self.precision = precision;
        self
    }

    /// Stable identity of everything that affects compiled kernels.
    ///
    /// The memory budget is excluded: it drifts between runs and does not
    /// change kernel code.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.family));
        hasher.update(b"|");
        hasher.update(self.features.join(","));
        hasher.update(b"|");
        hasher.update(format!("{:?}", self.precision));
        hasher.update(b"|");
        hasher.update(self.max_tile.to_le_bytes());
        hasher.update(self.simd_lanes.to_le_bytes());
        hasher.update(b"|");
        hasher.update(&self.arch);
        hasher.update(b"|");
        hasher.update(&self.os);
        hex::encode(hasher.finalize())
    }

    /// Human-readable capability summary.
    pub fn summary(&self) -> String {
        let features = if self.features.is_empty() {
            "none".to_string()
        } else {
            self.features.join(", ")
        };
        format!(
            "Accelerator: {} ({} {}, {} compute units)\n\
             Device: {}\n\
             Memory budget: {} MiB\n\
             Precision: {}\n\
             Max tile: {}\n\
             Features: {}",
            self.family,
            self.arch,
            self.os,
            self.compute_units,
            self.device_name,
            self.memory_budget / (1024 * 1024),
            precision_name(self.precision),
            self.max_tile,
            features
        )
    }
}

impl Default for DeviceCapability {
    fn default() -> Self {
        Self::scalar()
    }
}

pub fn precision_name(p: KvPrecision) -> &'static str {
    match p {
        KvPrecision::F32 => "f32",
        KvPrecision::F16 => "f16",
    }
}

// -- Profiler -----------------------------------------------------------------

static CAPABILITY: OnceLock<DeviceCapability> = OnceLock::new();

/// Process-wide device probe.
pub struct DeviceProfiler;

impl DeviceProfiler {
    /// The device descriptor, probed on first use and fixed afterwards.
    pub fn capability() -> &'static DeviceCapability {
        CAPABILITY.get_or_init(|| {
            let cap = Self::probe();
            tracing::info!(
                family = %cap.family,
                device = %cap.device_name,
                compute_units = cap.compute_units,
                memory_budget = cap.memory_budget,
                precision = precision_name(cap.precision),
                "device profiled"
            );
            cap
        })
    }

    /// Probe without memoisation. Never fails; degrades to [`DeviceCapability::scalar`].
    pub fn probe() -> DeviceCapability {
        let mut cap = DeviceCapability::scalar();
        if let Some(name) = cpu_model_name() {
            cap.device_name = name;
        }
        cap.memory_budget = available_memory()
            .map(|avail| (avail as f64 * MEMORY_FRACTION) as u64)
            .filter(|&b| b > 0)
            .unwrap_or(DEFAULT_MEMORY_BUDGET);

        if force_scalar() {
            cap.features.push("forced-scalar".into());
            return cap;
        }

        detect_vector_unit(&mut cap);
        cap.simd_lanes = cap.family.lanes();
        cap.max_tile = cap.family.default_tile();
        cap
    }
}

fn force_scalar() -> bool {
    matches!(
        std::env::var(FORCE_SCALAR_ENV).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(target_arch = "x86_64")]
fn detect_vector_unit(cap: &mut DeviceCapability) {
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        cap.family = AcceleratorFamily::Avx2;
        cap.features.push("avx2".into());
        cap.features.push("fma".into());
        if is_x86_feature_detected!("f16c") {
            cap.features.push("f16c".into());
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_vector_unit(cap: &mut DeviceCapability) {
    cap.family = AcceleratorFamily::Neon;
    cap.features.push("neon".into());
    if std::arch::is_aarch64_feature_detected!("fp16") {
        cap.features.push("fp16".into());
        cap.precision = KvPrecision::F16;
    }
    if std::arch::is_aarch64_feature_detected!("dotprod") {
        cap.features.push("dotprod".into());
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_vector_unit(_cap: &mut DeviceCapability) {}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
fn available_memory() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&text, "MemAvailable")
}

fn parse_meminfo(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn cpu_model_name() -> Option<String> {
    let text = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    text.lines()
        .find(|l| l.starts_with("model name") || l.starts_with("Hardware"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_is_memoised() {
        let a = DeviceProfiler::capability();
        let b = DeviceProfiler::capability();
        assert!(std::ptr::eq(a, b));
        assert!(a.family.is_supported());
    }

    #[test]
    fn fingerprint_ignores_memory_budget() {
        let cap = DeviceCapability::scalar();
        let other = cap.clone().with_memory_budget(123);
        assert_eq!(cap.fingerprint(), other.fingerprint());
        let f16 = cap.clone().with_precision(KvPrecision::F16);
        assert_ne!(cap.fingerprint(), f16.fingerprint());
    }

    #[test]
    fn summary_names_family_budget_and_precision() {
        let cap = DeviceCapability::scalar().with_memory_budget(512 * 1024 * 1024);
        let s = cap.summary();
        assert!(s.contains("Accelerator: Scalar"));
        assert!(s.contains("Memory budget: 512 MiB"));
        assert!(s.contains("Precision: f32"));
    }

    #[test]
    fn meminfo_parsing() {
        let text = "MemTotal:       16000000 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_meminfo(text, "MemAvailable"), Some(8_000_000 * 1024));
        assert_eq!(parse_meminfo(text, "SwapTotal"), None);
    }

    #[test]
    fn scalar_is_always_supported() {
        assert!(AcceleratorFamily::Scalar.is_supported());
    }
}
