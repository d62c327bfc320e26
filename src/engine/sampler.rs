//! Token sampling.
//!
//! The orchestration loop hands every request's logits row to a
//! [`TokenSampler`]. [`LogitsSampler`] is the stock implementation:
//!
//! - **Temperature**: Controls randomness (0 = greedy)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use std::collections::HashMap;

use candle_core::{DType, Tensor, D};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::core::request::RequestId;
use crate::error::{Error, Result};

/// A sampled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutput {
    pub token_id: u32,
    /// The token ends generation.
    pub is_eos: bool,
}

/// Chooses the next token of a request from its logits row.
pub trait TokenSampler: Send {
    /// Sample from `logits` of shape `[vocab_size]`.
    fn sample(
        &mut self,
        request_id: RequestId,
        logits: &Tensor,
        config: &SamplingConfig,
    ) -> Result<SampleOutput>;

    /// Drop any per-request state once a request finishes.
    fn release(&mut self, _request_id: RequestId) {}
}

/// Temperature / top-k / top-p sampler.
///
/// Requests with a `seed` get their own RNG so their output does not depend
/// on what else shares the batch; the rest draw from a shared RNG.
#[derive(Debug)]
pub struct LogitsSampler {
    rng: StdRng,
    seeded: HashMap<RequestId, StdRng>,
}

impl Default for LogitsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LogitsSampler {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            seeded: HashMap::new(),
        }
    }

    /// Seed the shared RNG for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seeded: HashMap::new(),
        }
    }

    fn sample_token(&mut self, request_id: RequestId, logits: &Tensor, config: &SamplingConfig) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        let vocab_size = logits.dim(0)?;
        if vocab_size == 0 {
            return Err(Error::InvalidArgument("empty logits row".into()));
        }

        // For temperature = 0, use greedy decoding (argmax)
        if config.temperature == 0.0 {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }
        let logits = if config.temperature != 1.0 {
            (logits / config.temperature as f64)?
        } else {
            logits
        };

        let (logits, indices) = if config.top_k > 0 && config.top_k < vocab_size {
            apply_top_k(&logits, config.top_k)?
        } else {
            (logits, (0..vocab_size as u32).collect())
        };

        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let mut probs: Vec<f32> = probs.to_vec1()?;
        let mut indices = indices;
        if config.top_p < 1.0 {
            (probs, indices) = apply_top_p(probs, indices, config.top_p);
        }

        let rng = match config.seed {
            Some(seed) => self
                .seeded
                .entry(request_id)
                .or_insert_with(|| StdRng::seed_from_u64(seed)),
            None => &mut self.rng,
        };
        sample_from_probs(&probs, &indices, rng)
    }
}

impl TokenSampler for LogitsSampler {
    fn sample(
        &mut self,
        request_id: RequestId,
        logits: &Tensor,
        config: &SamplingConfig,
    ) -> Result<SampleOutput> {
        let token_id = self.sample_token(request_id, logits, config)?;
        Ok(SampleOutput {
            token_id,
            is_eos: config.stop_token_ids.contains(&token_id),
        })
    }

    fn release(&mut self, request_id: RequestId) {
        self.seeded.remove(&request_id);
    }
}

/// Keep only the k tokens with highest logits.
fn apply_top_k(logits: &Tensor, k: usize) -> Result<(Tensor, Vec<u32>)> {
    let values: Vec<f32> = logits.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = values.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);

    let indices: Vec<u32> = indexed.iter().map(|&(i, _)| i as u32).collect();
    let values: Vec<f32> = indexed.iter().map(|&(_, v)| v).collect();
    let logits = Tensor::from_vec(values, k, logits.device())?;
    Ok((logits, indices))
}

/// Keep tokens until cumulative probability exceeds p.
fn apply_top_p(probs: Vec<f32>, indices: Vec<u32>, p: f32) -> (Vec<f32>, Vec<u32>) {
    let mut indexed: Vec<(f32, u32)> = probs.into_iter().zip(indices).collect();
    indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, (prob, _)) in indexed.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            // Include the token that pushed us over
            cutoff = i + 1;
            break;
        }
    }
    indexed.truncate(cutoff);
    indexed.into_iter().unzip()
}

fn sample_from_probs(probs: &[f32], indices: &[u32], rng: &mut StdRng) -> Result<u32> {
    let sum: f32 = probs.iter().sum();
    let normalized: Vec<f64> = probs.iter().map(|&p| (p / sum) as f64).collect();
    let dist = rand::distributions::WeightedIndex::new(&normalized)
        .map_err(|e| Error::InvalidArgument(format!("cannot sample from logits: {e}")))?;
    Ok(indices[dist.sample(rng)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(temperature: f32, top_k: usize, top_p: f32) -> SamplingConfig {
        SamplingConfig {
            temperature,
            top_k,
            top_p,
            ..SamplingConfig::default()
        }
    }

    #[test]
    fn test_greedy_sampling() {
        let mut sampler = LogitsSampler::with_seed(42);
        let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 0.4], &Device::Cpu).unwrap();
        let out = sampler.sample(1, &logits, &config(0.0, 0, 1.0)).unwrap();
        assert_eq!(out.token_id, 3);
        assert!(!out.is_eos);
    }

    #[test]
    fn test_stop_token_is_eos() {
        let mut sampler = LogitsSampler::with_seed(42);
        let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 0.4], &Device::Cpu).unwrap();
        let config = SamplingConfig {
            temperature: 0.0,
            stop_token_ids: vec![3],
            ..SamplingConfig::default()
        };
        assert!(sampler.sample(1, &logits, &config).unwrap().is_eos);
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        let mut sampler = LogitsSampler::with_seed(42);
        let logits = Tensor::new(&[0.0f32, 0.0, 0.0, 10.0, 0.0], &Device::Cpu).unwrap();
        for _ in 0..10 {
            let out = sampler.sample(1, &logits, &config(1.0, 0, 0.5)).unwrap();
            assert_eq!(out.token_id, 3);
        }
    }

    #[test]
    fn test_apply_top_p_cutoff() {
        let (probs, indices) = apply_top_p(vec![0.1, 0.6, 0.3], vec![7, 8, 9], 0.8);
        assert_eq!(indices, vec![8, 9]);
        assert_eq!(probs, vec![0.6, 0.3]);
    }
}
