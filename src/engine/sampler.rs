//! Next-token selection from logits.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::SamplingConfig;
use super::kernels::cpu;

/// Per-session sampler. Seeded once so a fixed seed reproduces a run.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
    candidates: Vec<(u32, f32)>,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            candidates: Vec::new(),
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Pick the next token. `logits` is modified in place; `history` is
    /// every token in the context so far.
    pub fn sample(&mut self, logits: &mut [f32], history: &[u32]) -> u32 {
        if self.config.repetition_penalty > 1.0 {
            apply_repetition_penalty(logits, history, self.config.repetition_penalty);
        }
        if self.config.is_greedy() {
            return argmax(logits);
        }

        self.candidates.clear();
        self.candidates
            .extend(logits.iter().enumerate().map(|(i, &l)| (i as u32, l)));
        self.candidates.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
        if self.config.top_k > 0 {
            self.candidates.truncate(self.config.top_k as usize);
        }

        let mut probs: Vec<f32> = self
            .candidates
            .iter()
            .map(|&(_, l)| l / self.config.temperature)
            .collect();
        cpu::softmax(&mut probs);

        // Nucleus: smallest prefix whose mass reaches top_p.
        let mut keep = probs.len();
        if self.config.top_p < 1.0 {
            let mut mass = 0.0;
            for (i, p) in probs.iter().enumerate() {
                mass += p;
                if mass >= self.config.top_p {
                    keep = i + 1;
                    break;
                }
            }
        }
        let total: f32 = probs[..keep].iter().sum();

        let mut r = self.rng.gen::<f32>() * total;
        for (i, p) in probs[..keep].iter().enumerate() {
            if r < *p {
                return self.candidates[i].0;
            }
            r -= p;
        }
        self.candidates[keep.saturating_sub(1)].0
    }
}

/// Index of the largest logit; the lowest index wins ties.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as u32
}

fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let seen: HashSet<u32> = history.iter().copied().collect();
    for id in seen {
        if let Some(l) = logits.get_mut(id as usize) {
            *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_takes_argmax() {
        let mut s = Sampler::new(SamplingConfig::greedy());
        assert_eq!(s.sample(&mut [0.1, 2.0, 1.9], &[]), 1);
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), 1);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let cfg = SamplingConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: Some(42),
        };
        let logits = vec![0.5, 0.4, 0.3, 0.2, 0.1, 0.0];
        let run = || {
            let mut s = Sampler::new(cfg.clone());
            (0..32).map(|_| s.sample(&mut logits.clone(), &[])).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn top_k_one_is_greedy() {
        let cfg = SamplingConfig {
            temperature: 1.5,
            top_k: 1,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: Some(1),
        };
        let mut s = Sampler::new(cfg);
        for _ in 0..16 {
            assert_eq!(s.sample(&mut [0.0, 0.1, 5.0, 0.2], &[]), 2);
        }
    }

    #[test]
    fn tiny_top_p_keeps_only_the_head() {
        let cfg = SamplingConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.01,
            repetition_penalty: 1.0,
            seed: Some(9),
        };
        let mut s = Sampler::new(cfg);
        for _ in 0..16 {
            assert_eq!(s.sample(&mut [1.0, 4.0, 2.0], &[]), 1);
        }
    }

    #[test]
    fn repetition_penalty_demotes_seen_tokens() {
        let cfg = SamplingConfig {
            repetition_penalty: 2.0,
            ..SamplingConfig::greedy()
        };
        let mut s = Sampler::new(cfg);
        assert_eq!(s.sample(&mut [3.0, 2.0], &[0]), 1);
    }
}
