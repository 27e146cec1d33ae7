//! Token sampling.
//!
//! Candle's [`LogitsProcessor`](candle_transformers::generation::LogitsProcessor)
//! does the heavy lifting; min-p filtering is applied to its probability vector
//! through the `sample_f` hook.

use super::params::GenerationParams;
use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor as CandleLogitsProcessor, Sampling};

pub struct LogitsProcessor {
    inner: CandleLogitsProcessor,
    min_p: Option<f64>,
}

impl LogitsProcessor {
    pub fn new(seed: u64, sampling: Sampling, min_p: Option<f64>) -> Self {
        Self {
            inner: CandleLogitsProcessor::from_sampling(seed, sampling),
            min_p,
        }
    }

    pub fn sample(&mut self, logits: &Tensor) -> candle_core::Result<u32> {
        match self.min_p {
            None => self.inner.sample(logits),
            Some(min_p) => self
                .inner
                .sample_f(logits, |prs| apply_min_p(prs, min_p as f32)),
        }
    }
}

/// Zero out every probability below `min_p * max(prs)`.
pub(crate) fn apply_min_p(prs: &mut [f32], min_p: f32) {
    if min_p <= 0.0 || min_p >= 1.0 {
        return;
    }

    let max_prob = prs.iter().copied().fold(0.0f32, f32::max);
    let threshold = min_p * max_prob;

    for p in prs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Initializes a LogitsProcessor based on sampling parameters.
pub fn initialize_logits_processor(params: &GenerationParams, seed: u64) -> LogitsProcessor {
    LogitsProcessor::new(seed, params.sampling_strategy(), params.min_p())
}

/// Penalize tokens seen among the last `repeat_last_n` generated tokens.
pub fn apply_repeat_penalty(
    logits: &Tensor,
    params: &GenerationParams,
    generated: &[u32],
) -> candle_core::Result<Tensor> {
    let start_at = generated.len().saturating_sub(params.repeat_last_n);
    let penalty_context = &generated[start_at..];

    if params.repeat_penalty <= 1. || penalty_context.is_empty() {
        return Ok(logits.clone());
    }
    candle_transformers::utils::apply_repeat_penalty(logits, params.repeat_penalty, penalty_context)
}
