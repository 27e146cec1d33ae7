use crate::core::GenerationConfig;
use candle_transformers::generation::Sampling;

const HF_DEFAULT_TOP_K: u64 = 50;

/// Generation parameters for language models.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// 0.0 means greedy decoding.
    pub temperature: f64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: u64,
    /// Maximum number of tokens generated per call.
    pub max_len: usize,
    pub top_p: f64,   // 0.0..=1.0 ; 0 or 1 means disabled
    pub top_k: usize, // 0 means disabled
    pub min_p: f64,   // 0.0..=1.0 ; 0 means disabled
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            seed: 299_792_458,
            max_len: 512,
            top_p: 1.0,
            top_k: 0,
            min_p: 0.0,
        }
    }
}

impl GenerationParams {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        temperature: f64,
        repeat_penalty: f32,
        repeat_last_n: usize,
        seed: u64,
        max_len: usize,
        top_p: f64,
        top_k: usize,
        min_p: f64,
    ) -> Self {
        Self {
            temperature,
            repeat_penalty,
            repeat_last_n,
            seed,
            max_len,
            top_p,
            top_k,
            min_p,
        }
    }

    /// Defaults published with a model, read with Hugging Face semantics:
    /// decoding is greedy unless `do_sample` is set.
    pub fn from_config(config: &GenerationConfig) -> Self {
        let defaults = Self::default();
        let do_sample = config.do_sample.unwrap_or(false);

        Self {
            temperature: if do_sample {
                config.temperature.unwrap_or(1.0)
            } else {
                0.0
            },
            repeat_penalty: config.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            repeat_last_n: config.repeat_last_n.unwrap_or(defaults.repeat_last_n),
            seed: defaults.seed,
            max_len: config.max_new_tokens.unwrap_or(defaults.max_len),
            top_p: config.top_p.unwrap_or(defaults.top_p),
            top_k: if do_sample {
                config.top_k.unwrap_or(HF_DEFAULT_TOP_K) as usize
            } else {
                0
            },
            min_p: config.min_p.unwrap_or(defaults.min_p),
        }
    }

    /// Pick the candle sampling strategy matching these parameters.
    pub fn sampling_strategy(&self) -> Sampling {
        if self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }

        let temperature = self.temperature.max(1e-7);
        let top_p_active = self.top_p > 0.0 && self.top_p < 1.0;

        match (self.top_k > 0, top_p_active) {
            (true, true) => Sampling::TopKThenTopP {
                k: self.top_k,
                p: self.top_p,
                temperature,
            },
            (true, false) => Sampling::TopK {
                k: self.top_k,
                temperature,
            },
            (false, true) => Sampling::TopP {
                p: self.top_p,
                temperature,
            },
            (false, false) => Sampling::All { temperature },
        }
    }

    /// `Some` only when min-p filtering should run.
    pub fn min_p(&self) -> Option<f64> {
        (self.min_p > 0.0 && self.min_p < 1.0).then_some(self.min_p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_is_greedy() {
        let params = GenerationParams::default();
        assert!(matches!(params.sampling_strategy(), Sampling::ArgMax));
    }

    #[test]
    fn top_k_and_top_p_combine() {
        let params = GenerationParams {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            ..Default::default()
        };
        assert!(matches!(
            params.sampling_strategy(),
            Sampling::TopKThenTopP { k: 40, .. }
        ));
    }

    #[test]
    fn top_p_of_one_is_disabled() {
        let params = GenerationParams {
            temperature: 0.7,
            top_p: 1.0,
            ..Default::default()
        };
        assert!(matches!(params.sampling_strategy(), Sampling::All { .. }));
        assert_eq!(params.min_p(), None);
    }

    #[test]
    fn config_without_do_sample_decodes_greedily() {
        let config = GenerationConfig {
            temperature: Some(0.8),
            eos_token_ids: vec![100015],
            ..Default::default()
        };
        let params = GenerationParams::from_config(&config);
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.max_len, 512);
        assert!(matches!(params.sampling_strategy(), Sampling::ArgMax));
    }

    #[test]
    fn config_with_do_sample_uses_published_values() {
        let config = GenerationConfig {
            do_sample: Some(true),
            temperature: Some(0.6),
            top_p: Some(0.95),
            repeat_penalty: Some(1.1),
            max_new_tokens: Some(128),
            ..Default::default()
        };
        let params = GenerationParams::from_config(&config);
        assert_eq!(params.temperature, 0.6);
        assert_eq!(params.top_k, 50);
        assert_eq!(params.repeat_penalty, 1.1);
        assert_eq!(params.max_len, 128);
        assert!(matches!(
            params.sampling_strategy(),
            Sampling::TopKThenTopP { k: 50, .. }
        ));
    }
}
