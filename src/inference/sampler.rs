//! Token sampling
//!
//! Applies logit bias and penalties, an optional allow-mask, then picks the
//! next token greedily or by nucleus (top-p) sampling.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::inference::backend::TokenId;

/// Below this temperature sampling is greedy
const GREEDY_TEMPERATURE: f32 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// Multiplicative penalty for tokens seen in the reply, 1.0 = off
    pub repetition_penalty: f32,
    pub logit_bias: HashMap<TokenId, f32>,
    pub seed: Option<u64>,
    pub logprobs: bool,
    pub top_logprobs: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_penalty: 1.0,
            logit_bias: HashMap::new(),
            seed: None,
            logprobs: false,
            top_logprobs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingError {
    #[error("logits are empty")]
    EmptyLogits,

    #[error("logits contain NaN")]
    NotANumber,

    #[error("no token is allowed at this position")]
    NoAllowedToken,

    #[error("sampling distribution is degenerate")]
    Degenerate,
}

/// A chosen token with its log probability and the best alternatives
#[derive(Debug, Clone, PartialEq)]
pub struct SampledToken {
    pub token: TokenId,
    pub logprob: f32,
    /// Highest-probability tokens, best first; empty unless requested
    pub top: Vec<(TokenId, f32)>,
}

pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
    /// Occurrences of each token generated so far
    counts: HashMap<TokenId, usize>,
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
            counts: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Count a generated token towards the penalties
    pub fn accept(&mut self, token: TokenId) {
        *self.counts.entry(token).or_insert(0) += 1;
    }

    fn apply_penalties(&self, logits: &mut [f32]) {
        for (&token, &bias) in &self.config.logit_bias {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit += bias;
            }
        }

        let rp = self.config.repetition_penalty;
        for (&token, &count) in &self.counts {
            let Some(logit) = logits.get_mut(token as usize) else {
                continue;
            };
            if rp != 1.0 {
                if *logit > 0.0 {
                    *logit /= rp;
                } else {
                    *logit *= rp;
                }
            }
            *logit -= self.config.presence_penalty + self.config.frequency_penalty * count as f32;
        }
    }

    /// Pick the next token. Tokens with `allowed[token] == false` are never chosen.
    pub fn sample(&mut self, logits: &[f32], allowed: Option<&[bool]>) -> Result<SampledToken, SamplingError> {
        if logits.is_empty() {
            return Err(SamplingError::EmptyLogits);
        }
        if logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::NotANumber);
        }

        let mut logits = logits.to_vec();
        self.apply_penalties(&mut logits);
        if logits.iter().any(|l| l.is_nan() || *l == f32::INFINITY) {
            return Err(SamplingError::Degenerate);
        }
        if let Some(allowed) = allowed {
            for (token, logit) in logits.iter_mut().enumerate() {
                if !allowed.get(token).copied().unwrap_or(false) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }
        if logits.iter().all(|l| *l == f32::NEG_INFINITY) {
            return Err(SamplingError::NoAllowedToken);
        }

        let log_probs = log_softmax(&logits);
        let token = if self.config.temperature < GREEDY_TEMPERATURE {
            argmax(&logits)
        } else {
            self.sample_top_p(&logits)?
        };

        let top = if self.config.logprobs && self.config.top_logprobs > 0 {
            top_k(&log_probs, self.config.top_logprobs)
        } else {
            Vec::new()
        };

        Ok(SampledToken {
            token,
            logprob: log_probs[token as usize],
            top,
        })
    }

    fn sample_top_p(&mut self, logits: &[f32]) -> Result<TokenId, SamplingError> {
        let inv_temp = 1.0 / self.config.temperature;
        let scaled: Vec<f32> = logits.iter().map(|l| l * inv_temp).collect();
        let probs = softmax(&scaled);
        if probs.iter().any(|p| !p.is_finite()) {
            return Err(SamplingError::Degenerate);
        }

        let mut order: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
        if order.is_empty() {
            return Err(SamplingError::Degenerate);
        }
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        // Smallest prefix whose mass reaches top_p
        let top_p = self.config.top_p.clamp(f32::MIN_POSITIVE, 1.0);
        let mut cutoff = order.len();
        let mut mass = 0.0f32;
        for (rank, &token) in order.iter().enumerate() {
            mass += probs[token];
            if mass >= top_p {
                cutoff = rank + 1;
                break;
            }
        }
        let nucleus = &order[..cutoff.max(1)];

        let total: f32 = nucleus.iter().map(|&t| probs[t]).sum();
        let mut draw = self.rng.gen::<f32>() * total;
        for &token in nucleus {
            draw -= probs[token];
            if draw <= 0.0 {
                return Ok(token as TokenId);
            }
        }
        Ok(nucleus[nucleus.len() - 1] as TokenId)
    }
}

fn argmax(values: &[f32]) -> TokenId {
    values
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0 as TokenId
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    let log_sum = max + sum.ln();
    logits.iter().map(|l| l - log_sum).collect()
}

fn top_k(log_probs: &[f32], k: usize) -> Vec<(TokenId, f32)> {
    let mut ranked: Vec<(TokenId, f32)> = log_probs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(i, &lp)| (i as TokenId, lp))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greedy() -> SamplingConfig {
        SamplingConfig {
            temperature: 0.0,
            ..SamplingConfig::default()
        }
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let mut sampler = Sampler::new(greedy());
        let sampled = sampler.sample(&[0.1, 3.0, 0.5], None).unwrap();
        assert_eq!(sampled.token, 1);
        assert!(sampled.logprob < 0.0);
    }

    #[test]
    fn test_mask_excludes_tokens() {
        let mut sampler = Sampler::new(greedy());
        let sampled = sampler.sample(&[0.1, 3.0, 0.5], Some(&[true, false, true])).unwrap();
        assert_eq!(sampled.token, 2);

        let err = sampler.sample(&[0.1, 3.0], Some(&[false, false])).unwrap_err();
        assert_eq!(err, SamplingError::NoAllowedToken);
    }

    #[test]
    fn test_logit_bias_and_penalties() {
        let mut config = greedy();
        config.logit_bias.insert(0, 10.0);
        let mut sampler = Sampler::new(config);
        assert_eq!(sampler.sample(&[0.0, 5.0], None).unwrap().token, 0);

        let mut sampler = Sampler::new(SamplingConfig {
            presence_penalty: 2.0,
            ..greedy()
        });
        sampler.accept(1);
        assert_eq!(sampler.sample(&[1.0, 2.5], None).unwrap().token, 0);
    }

    #[test]
    fn test_overflowing_bias_is_an_error() {
        for temperature in [0.0, 0.7] {
            let mut config = SamplingConfig {
                temperature,
                ..SamplingConfig::default()
            };
            config.logit_bias.insert(1, f32::INFINITY);
            let mut sampler = Sampler::new(config);
            let err = sampler.sample(&[0.0, 1.0, 2.0], None).unwrap_err();
            assert_eq!(err, SamplingError::Degenerate);
        }
    }

    #[test]
    fn test_nucleus_never_empty() {
        let mut sampler = Sampler::new(SamplingConfig {
            temperature: 1.0,
            ..SamplingConfig::default()
        });
        assert_eq!(sampler.sample_top_p(&[f32::NAN, 1.0]), Err(SamplingError::Degenerate));
        assert_eq!(
            sampler.sample_top_p(&[f32::NEG_INFINITY, f32::NEG_INFINITY]),
            Err(SamplingError::Degenerate)
        );
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let config = SamplingConfig {
            temperature: 1.0,
            top_p: 1.0,
            seed: Some(42),
            ..SamplingConfig::default()
        };
        let logits = [1.0, 1.1, 0.9, 1.05, 0.95];
        let mut a = Sampler::new(config.clone());
        let mut b = Sampler::new(config);
        let run_a: Vec<TokenId> = (0..20).map(|_| a.sample(&logits, None).unwrap().token).collect();
        let run_b: Vec<TokenId> = (0..20).map(|_| b.sample(&logits, None).unwrap().token).collect();
        assert_eq!(run_a, run_b);
    }

    #[test]
    fn test_small_top_p_keeps_best_token() {
        let mut sampler = Sampler::new(SamplingConfig {
            temperature: 1.0,
            top_p: 0.01,
            ..SamplingConfig::default()
        });
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[0.0, 4.0, 1.0], None).unwrap().token, 1);
        }
    }

    #[test]
    fn test_top_logprobs() {
        let mut sampler = Sampler::new(SamplingConfig {
            logprobs: true,
            top_logprobs: 2,
            ..greedy()
        });
        let sampled = sampler.sample(&[1.0, 3.0, 2.0], None).unwrap();
        let ranked: Vec<TokenId> = sampled.top.iter().map(|(t, _)| *t).collect();
        assert_eq!(ranked, vec![1, 2]);
    }
}
