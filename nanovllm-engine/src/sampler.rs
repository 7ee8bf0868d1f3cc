use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::tensor::softmax;

/// Per-request sampling parameters.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Sampling temperature; 0 selects greedy decoding.
    pub temperature: f32,
    /// Maximum number of new tokens to generate.
    pub max_tokens: usize,
    /// Keep generating past the eos token.
    pub ignore_eos: bool,
    /// Nucleus sampling mass in (0, 1]; 1 disables.
    pub top_p: f32,
    /// Top-k cutoff; 0 disables.
    pub top_k: usize,
    /// Repetition penalty; 1.0 disables.
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 64,
            ignore_eos: false,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 {
            return Err(EngineError::Config("temperature must be non-negative".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(EngineError::Config("max_tokens must be positive".to_string()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::Config("top_p must be in (0, 1]".to_string()));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(EngineError::Config("repetition_penalty must be positive".to_string()));
        }
        Ok(())
    }
}

/// Converts per-step logits into tokens under temperature, penalties,
/// top-k and top-p filters, using a seedable xorshift RNG so runs are
/// reproducible.
#[derive(Debug)]
pub struct Sampler {
    rng_state: u64,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        // Xorshift must not start from an all-zero state.
        Self {
            rng_state: seed.max(1),
        }
    }

    /// Xorshift-based random number generator.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Samples one token id from the logits of the sequence's last position.
    ///
    /// `prev_tokens` is the sequence's full token history and feeds the
    /// repetition, presence and frequency penalties. The logits buffer is
    /// clobbered.
    pub fn sample(&mut self, logits: &mut [f32], prev_tokens: &[u32], params: &SamplingParams) -> u32 {
        let coin = self.random_f32();
        Self::sample_with_coin(logits, prev_tokens, params, coin)
    }

    /// Deterministic core of `sample`, taking the uniform draw explicitly.
    pub(crate) fn sample_with_coin(
        logits: &mut [f32],
        prev_tokens: &[u32],
        params: &SamplingParams,
        coin: f32,
    ) -> u32 {
        if params.temperature == 0.0 {
            return argmax(logits) as u32;
        }

        // Fallback target in case filtering masks out every candidate.
        let premask_argmax = argmax(logits) as u32;

        logits.iter_mut().for_each(|logit| *logit /= params.temperature);

        apply_penalties(logits, prev_tokens, params);

        if params.top_k > 0 && params.top_k < logits.len() {
            top_k_mask(logits, params.top_k);
        }

        softmax(logits);

        if params.top_p > 0.0 && params.top_p < 1.0 {
            top_p_renormalize(logits, params.top_p);
        }

        match sample_from_probs(logits, coin) {
            Some(token) => token as u32,
            None => premask_argmax,
        }
    }
}

/// Index of the largest logit; ties break toward the lower token id.
fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &value) in logits.iter().enumerate().skip(1) {
        if value.total_cmp(&logits[best]) == std::cmp::Ordering::Greater {
            best = i;
        }
    }
    best
}

/// Repetition, presence and frequency penalties over the count of each
/// token in the sequence's prior tokens.
fn apply_penalties(logits: &mut [f32], prev_tokens: &[u32], params: &SamplingParams) {
    if prev_tokens.is_empty() {
        return;
    }
    let penalizing = params.repetition_penalty != 1.0
        || params.presence_penalty != 0.0
        || params.frequency_penalty != 0.0;
    if !penalizing {
        return;
    }

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &token in prev_tokens {
        *counts.entry(token).or_insert(0) += 1;
    }

    for (&token, &count) in &counts {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };

        if params.repetition_penalty != 1.0 {
            if *logit > 0.0 {
                *logit /= params.repetition_penalty;
            } else {
                *logit *= params.repetition_penalty;
            }
        }
        *logit -= params.presence_penalty + params.frequency_penalty * count as f32;
    }
}

/// Masks every logit strictly below the k-th largest to -inf.
fn top_k_mask(logits: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];

    logits.iter_mut().for_each(|logit| {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    });
}

/// Keeps the smallest probability prefix with cumulative mass >= p, zeroes
/// the rest and renormalizes. Ties in the descending sort break toward the
/// lower token id.
fn top_p_renormalize(probs: &mut [f32], p: f32) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));

    let mut cumulative = 0.0f32;
    let mut kept = probs.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            kept = rank + 1;
            break;
        }
    }

    for &idx in &order[kept..] {
        probs[idx] = 0.0;
    }

    let total: f32 = probs.iter().sum();
    if total > 0.0 {
        let inv = total.recip();
        probs.iter_mut().for_each(|prob| *prob *= inv);
    }
}

/// Inverse-CDF draw over a categorical distribution. `None` when the
/// distribution carries no mass (everything was masked out).
fn sample_from_probs(probs: &[f32], coin: f32) -> Option<usize> {
    let total: f32 = probs.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return None;
    }

    let mut cdf = 0.0f32;
    for (i, &prob) in probs.iter().enumerate() {
        cdf += prob;
        if coin < cdf {
            return Some(i);
        }
    }
    // Guard against rounding at the distribution's tail.
    probs.iter().rposition(|&prob| prob > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_short_circuit() {
        let mut logits = [0.1, 2.0, 0.5];
        let params = SamplingParams {
            temperature: 0.0,
            ..SamplingParams::default()
        };
        assert_eq!(Sampler::sample_with_coin(&mut logits, &[], &params, 0.99), 1);
    }

    #[test]
    fn test_argmax_tie_breaks_low_id() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 0.0]), 1);
    }

    #[test]
    fn test_top_p_masking() {
        // Scenario: probs [0.4, 0.3, 0.2, 0.1], top_p = 0.7.
        let base = [0.4f32.ln(), 0.3f32.ln(), 0.2f32.ln(), 0.1f32.ln()];
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.7,
            ..SamplingParams::default()
        };

        let mut logits = base;
        assert_eq!(Sampler::sample_with_coin(&mut logits, &[], &params, 0.1), 0);
        // After filtering the distribution is [0.4/0.7, 0.3/0.7, 0, 0].
        assert_eq!(logits[2], 0.0);
        assert_eq!(logits[3], 0.0);
        assert!((logits[0] - 0.4 / 0.7).abs() < 1e-5);

        let mut logits = base;
        assert_eq!(Sampler::sample_with_coin(&mut logits, &[], &params, 0.6), 1);
    }

    #[test]
    fn test_top_k_masks_tail() {
        let mut logits = [1.0, 5.0, 3.0, 4.0];
        top_k_mask(&mut logits, 2);
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[2], f32::NEG_INFINITY);
        assert_eq!(logits[1], 5.0);
        assert_eq!(logits[3], 4.0);
    }

    #[test]
    fn test_top_k_one_is_effectively_greedy() {
        let params = SamplingParams {
            temperature: 0.8,
            top_k: 1,
            ..SamplingParams::default()
        };
        for coin in [0.0, 0.42, 0.999] {
            let mut logits = [0.3, -0.2, 1.4, 0.0];
            assert_eq!(Sampler::sample_with_coin(&mut logits, &[], &params, coin), 2);
        }
    }

    #[test]
    fn test_repetition_penalty_direction() {
        let mut logits = [2.0, -2.0, 1.0];
        let params = SamplingParams {
            repetition_penalty: 2.0,
            ..SamplingParams::default()
        };
        apply_penalties(&mut logits, &[0, 1], &params);
        // Positive logits shrink, negative logits grow more negative.
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[1], -4.0);
        assert_eq!(logits[2], 1.0);
    }

    #[test]
    fn test_presence_and_frequency_penalties() {
        let mut logits = [0.0, 0.0, 0.0];
        let params = SamplingParams {
            presence_penalty: 0.5,
            frequency_penalty: 0.25,
            ..SamplingParams::default()
        };
        apply_penalties(&mut logits, &[1, 1, 1, 2], &params);
        assert_eq!(logits[0], 0.0);
        assert_eq!(logits[1], -0.5 - 0.25 * 3.0);
        assert_eq!(logits[2], -0.5 - 0.25);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let logits: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin()).collect();
        let params = SamplingParams {
            temperature: 0.9,
            top_p: 0.8,
            top_k: 8,
            ..SamplingParams::default()
        };

        let run = |seed| {
            let mut sampler = Sampler::new(seed);
            (0..32)
                .map(|_| {
                    let mut step_logits = logits.clone();
                    sampler.sample(&mut step_logits, &[3, 5, 3], &params)
                })
                .collect::<Vec<u32>>()
        };

        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn test_all_masked_falls_back_to_premask_argmax() {
        // Heavy penalties push the whole distribution to zero mass after
        // masking; the sampler must fall back to the pre-mask argmax.
        let mut probs = [0.0f32, 0.0, 0.0];
        assert_eq!(sample_from_probs(&probs, 0.5), None);
        probs[1] = 1.0;
        assert_eq!(sample_from_probs(&probs, 0.5), Some(1));
    }

    #[test]
    fn test_sampling_params_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams {
            temperature: -1.0,
            ..SamplingParams::default()
        }
        .validate()
        .is_err());
        assert!(SamplingParams {
            max_tokens: 0,
            ..SamplingParams::default()
        }
        .validate()
        .is_err());
        assert!(SamplingParams {
            top_p: 0.0,
            ..SamplingParams::default()
        }
        .validate()
        .is_err());
    }
}
