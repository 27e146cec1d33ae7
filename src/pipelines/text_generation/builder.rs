use super::model::TextGenerationModel;
use super::pipeline::TextGenerationPipeline;
use crate::core::{global_cache, ModelOptions};
use crate::models::generation::GenerationParams;
use crate::models::{LlamaModel, ModelSource};
use crate::pipelines::utils::{build_cache_key, DeviceRequest, DeviceSelectable};

/// Builder for text generation pipelines.
///
/// Sampling settings left unset fall back to the model's published defaults.
pub struct TextGenerationPipelineBuilder<M: TextGenerationModel> {
    model_options: M::Options,
    temperature: Option<f64>,
    repeat_penalty: Option<f32>,
    repeat_last_n: Option<usize>,
    seed: Option<u64>,
    max_len: Option<usize>,
    top_p: Option<f64>,
    top_k: Option<usize>,
    min_p: Option<f64>,
    device_request: DeviceRequest,
}

impl<M: TextGenerationModel> TextGenerationPipelineBuilder<M> {
    pub fn new(options: M::Options) -> Self {
        Self {
            model_options: options,
            temperature: None,
            repeat_penalty: None,
            repeat_last_n: None,
            seed: None,
            max_len: None,
            top_p: None,
            top_k: None,
            min_p: None,
            device_request: DeviceRequest::Default,
        }
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn repeat_penalty(mut self, repeat_penalty: f32) -> Self {
        self.repeat_penalty = Some(repeat_penalty);
        self
    }

    pub fn repeat_last_n(mut self, repeat_last_n: usize) -> Self {
        self.repeat_last_n = Some(repeat_last_n);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Maximum number of tokens generated per call.
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p.clamp(0.0, 1.0));
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn min_p(mut self, min_p: f64) -> Self {
        self.min_p = Some(min_p.clamp(0.0, 1.0));
        self
    }

    /// Layer the builder's overrides on top of the model defaults.
    fn generation_params(&self, defaults: GenerationParams) -> GenerationParams {
        GenerationParams::new(
            self.temperature.unwrap_or(defaults.temperature),
            self.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            self.repeat_last_n.unwrap_or(defaults.repeat_last_n),
            self.seed.unwrap_or_else(rand::random::<u64>),
            self.max_len.unwrap_or(defaults.max_len),
            self.top_p.unwrap_or(defaults.top_p),
            self.top_k.unwrap_or(defaults.top_k),
            self.min_p.unwrap_or(defaults.min_p),
        )
    }

    pub async fn build(self) -> anyhow::Result<TextGenerationPipeline<M>>
    where
        M: Clone + Send + Sync + 'static,
        M::Options: ModelOptions + Clone,
    {
        let device = self.device_request.clone().resolve()?;

        // Always use the global cache to share models
        let cache_key = build_cache_key(&self.model_options, &device);
        let model = global_cache()
            .get_or_create_async(&cache_key, || {
                M::new(self.model_options.clone(), device.clone())
            })
            .await?;

        let gen_params = self.generation_params(model.default_generation_params());
        tracing::debug!(?gen_params, "building text generation pipeline");

        TextGenerationPipeline::new(model, gen_params, device).await
    }
}

impl<M: TextGenerationModel> DeviceSelectable for TextGenerationPipelineBuilder<M> {
    fn device_request_mut(&mut self) -> &mut DeviceRequest {
        &mut self.device_request
    }
}

impl TextGenerationPipelineBuilder<LlamaModel> {
    /// Gorilla OpenFunctions v2.
    pub fn gorilla() -> Self {
        Self::new(ModelSource::gorilla_openfunctions_v2())
    }
}
