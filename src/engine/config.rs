//! Per-call generation configuration.
//!
//! All fields have safe defaults. Configuration is validated before use.

use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Token sampling strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy, 1.0 = unscaled)
    pub temperature: f32,
    /// Top-k sampling limit (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling threshold (0.0–1.0]
    pub top_p: f32,
    /// Repetition penalty (1.0 = none, >1.0 = penalize repeats)
    pub repetition_penalty: f32,
    /// RNG seed. None draws one from the OS per session.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repetition_penalty: 1.1,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: None,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Validate configuration values. Returns error on invalid values.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(EngineError::InvalidInput(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::InvalidInput(
                "top_p must be in range (0.0, 1.0]".into(),
            ));
        }
        if !(self.repetition_penalty >= 1.0) {
            return Err(EngineError::InvalidInput(
                "repetition_penalty must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters for one generate call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub sampling: SamplingConfig,
    /// Keep going past end-of-sequence until another stop condition.
    pub ignore_eos: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            sampling: SamplingConfig::default(),
            ignore_eos: false,
        }
    }
}

impl GenerationParams {
    pub fn new(max_tokens: usize, sampling: SamplingConfig) -> Self {
        Self {
            max_tokens,
            sampling,
            ignore_eos: false,
        }
    }

    pub fn greedy(max_tokens: usize) -> Self {
        Self::new(max_tokens, SamplingConfig::greedy())
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.sampling.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SamplingConfig::default().validate().is_ok());
        assert!(SamplingConfig::greedy().validate().is_ok());
        assert!(GenerationParams::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            SamplingConfig { temperature: -0.1, ..Default::default() },
            SamplingConfig { temperature: f32::NAN, ..Default::default() },
            SamplingConfig { top_p: 0.0, ..Default::default() },
            SamplingConfig { top_p: 1.5, ..Default::default() },
            SamplingConfig { repetition_penalty: 0.5, ..Default::default() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{:?} should be rejected", cfg);
        }
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: SamplingConfig = toml::from_str("temperature = 0.0\nseed = 7").unwrap();
        assert!(cfg.is_greedy());
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.top_k, 40);
    }
}
