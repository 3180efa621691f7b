//! Token selection policies over a `[rows, vocab]` score matrix.
//!
//! Each policy returns the chosen token per row together with the
//! probability of that token under the *unrestricted* softmax, so callers
//! get comparable log-probs whichever strategy picked the token.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{DecoderError, Result};
use crate::request::SamplingConfig;

/// Tokens chosen for each row of a score matrix.
#[derive(Debug, Clone)]
pub struct Selection {
    /// U32 `[rows]`.
    pub tokens: Tensor,
    /// F32 `[rows]`: unrestricted softmax probability of each token.
    pub probs: Tensor,
    /// F32 `[rows]`: natural log of `probs`.
    pub log_probs: Tensor,
}

impl Selection {
    pub fn token_ids(&self) -> Result<Vec<u32>> {
        Ok(self.tokens.to_vec1()?)
    }

    pub fn log_prob_values(&self) -> Result<Vec<f32>> {
        Ok(self.log_probs.to_vec1()?)
    }
}

/// The strategy honored for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingPolicy {
    Greedy,
    TopK(usize),
    TopP(f32),
}

impl SamplingPolicy {
    /// Top-p wins over top-k, which wins over greedy.
    pub fn from_config(config: &SamplingConfig) -> Self {
        if let Some(p) = config.top_p {
            return Self::TopP(p);
        }
        match config.top_k {
            Some(k) if k > 0 => Self::TopK(k),
            _ => Self::Greedy,
        }
    }
}

/// RNG used for the multinomial draw of stochastic policies.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

/// Promote a vector to a single-row matrix and normalize the dtype.
fn as_matrix(logits: &Tensor) -> Result<Tensor> {
    let logits = match logits.rank() {
        1 => logits.unsqueeze(0)?,
        2 => logits.clone(),
        _ => {
            return Err(DecoderError::InvalidShape {
                expected: "[vocab] or [rows, vocab]".to_string(),
                found: format!("{:?}", logits.dims()),
            })
        }
    };
    Ok(logits.to_dtype(DType::F32)?.contiguous()?)
}

fn select(raw_probs: &Tensor, tokens: Tensor) -> Result<Selection> {
    let probs = raw_probs
        .gather(&tokens.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?;
    let log_probs = probs.log()?;
    Ok(Selection {
        tokens,
        probs,
        log_probs,
    })
}

pub fn greedy_search_sampling_batch(logits: &Tensor) -> Result<Selection> {
    let logits = as_matrix(logits)?;
    let raw_probs = softmax_last_dim(&logits)?;
    let tokens = logits.argmax(D::Minus1)?.to_dtype(DType::U32)?;
    select(&raw_probs, tokens)
}

/// Scores outside the `k` highest per row replaced by `-inf`.
///
/// Entries tied with the k-th largest score stay in.
pub fn top_k_mask(logits: &Tensor, k: usize) -> Result<Tensor> {
    let logits = as_matrix(logits)?;
    let (rows, vocab) = logits.dims2()?;
    let k = k.clamp(1, vocab);
    let (sorted, _) = logits.sort_last_dim(false)?;
    let kth = sorted.narrow(1, k - 1, 1)?;
    let keep = logits.broadcast_ge(&kth)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (rows, vocab), logits.device())?;
    Ok(keep.where_cond(&logits, &neg_inf)?)
}

/// Scores outside the nucleus replaced by `-inf`.
///
/// The nucleus is the shortest descending prefix whose cumulative softmax
/// mass exceeds `p`. The exclusion mask is shifted right by one so the
/// element that crosses `p` is kept, and the top element always is.
pub fn top_p_mask(logits: &Tensor, p: f32) -> Result<Tensor> {
    let logits = as_matrix(logits)?;
    let (rows, vocab) = logits.dims2()?;
    let device = logits.device();

    let (sorted_logits, sorted_indices) = logits.sort_last_dim(false)?;
    let cumulative = softmax_last_dim(&sorted_logits)?.cumsum(1)?;
    let exceeds = cumulative.gt(p as f64)?;

    let keep_first = Tensor::zeros((rows, 1), DType::U8, device)?;
    let sorted_remove = if vocab > 1 {
        Tensor::cat(&[&keep_first, &exceeds.narrow(1, 0, vocab - 1)?], 1)?
    } else {
        keep_first
    };

    // Inverse permutation maps the sorted mask back onto vocabulary order.
    let inverse = sorted_indices.arg_sort_last_dim(true)?;
    let remove = sorted_remove.contiguous()?.gather(&inverse, 1)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (rows, vocab), device)?;
    Ok(remove.where_cond(&neg_inf, &logits)?)
}

fn sample_restricted(
    logits: &Tensor,
    restricted: &Tensor,
    state: &mut SamplerState,
) -> Result<Selection> {
    let raw_probs = softmax_last_dim(logits)?;
    let probs = softmax_last_dim(restricted)?;
    let tokens = multinomial(&probs, &mut state.rng)?;
    select(&raw_probs, tokens)
}

pub fn top_k_sampling_batch(
    logits: &Tensor,
    k: usize,
    state: &mut SamplerState,
) -> Result<Selection> {
    let logits = as_matrix(logits)?;
    let restricted = top_k_mask(&logits, k)?;
    sample_restricted(&logits, &restricted, state)
}

pub fn top_p_sampling_batch(
    logits: &Tensor,
    p: f32,
    state: &mut SamplerState,
) -> Result<Selection> {
    let logits = as_matrix(logits)?;
    let restricted = top_p_mask(&logits, p)?;
    sample_restricted(&logits, &restricted, state)
}

pub fn sample_batch(
    logits: &Tensor,
    policy: SamplingPolicy,
    state: &mut SamplerState,
) -> Result<Selection> {
    match policy {
        SamplingPolicy::Greedy => greedy_search_sampling_batch(logits),
        SamplingPolicy::TopK(k) => top_k_sampling_batch(logits, k, state),
        SamplingPolicy::TopP(p) => top_p_sampling_batch(logits, p, state),
    }
}

/// Select one token for a single request from its `[1, vocab]` scores.
pub fn decode_single_request(
    config: &SamplingConfig,
    logits: &Tensor,
    state: &mut SamplerState,
) -> Result<Selection> {
    if logits.rank() != 2 || logits.dim(0)? != 1 {
        return Err(DecoderError::InvalidShape {
            expected: "[1, vocab]".to_string(),
            found: format!("{:?}", logits.dims()),
        });
    }
    sample_batch(logits, SamplingPolicy::from_config(config), state)
}

fn multinomial(probs: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let rows: Vec<Vec<f32>> = probs.to_vec2()?;
    let ids: Vec<u32> = rows
        .iter()
        .map(|row| sample_from_probs(row, rng))
        .collect();
    let n = ids.len();
    Ok(Tensor::from_vec(ids, n, probs.device())?)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let total: f32 = probs.iter().sum();
    let target = rng.gen::<f32>() * total;
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if target < cumsum {
            return i as u32;
        }
    }
    // Rounding left target past the end: take the last candidate still in play
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0) as u32
}
