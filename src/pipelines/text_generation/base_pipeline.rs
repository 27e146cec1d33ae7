use super::model::{LanguageModelContext, TextGenerationModel};
use crate::core::PipelineError;
use crate::models::generation::{
    apply_repeat_penalty, initialize_logits_processor, GenerationParams,
};
use async_stream::try_stream;
use candle_core::{Device, Tensor};
use futures::Stream;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;

/// Prompt tokens are fed to the model at most this many at a time.
const PREFILL_CHUNK_SIZE: usize = 64;

/// State shared by every text-generation entry point: the model, one inference
/// context and the tokens that context has already seen.
pub struct BasePipeline<M: TextGenerationModel> {
    pub model: Arc<Mutex<M>>,
    pub model_tokenizer: Tokenizer,
    pub context: Arc<Mutex<M::Context>>,
    pub gen_params: Arc<Mutex<GenerationParams>>,
    pub device: Device,
    /// Every token fed to `context` since its last reset.
    pub last_processed_tokens: Arc<Mutex<Vec<u32>>>,
}

impl<M: TextGenerationModel> BasePipeline<M> {
    pub async fn new(model: M, gen_params: GenerationParams, device: Device) -> anyhow::Result<Self> {
        let model_tokenizer = model.get_tokenizer().await?;
        let context = model.new_context();

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_tokenizer,
            context: Arc::new(Mutex::new(context)),
            gen_params: Arc::new(Mutex::new(gen_params)),
            device,
            last_processed_tokens: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Get the current position in the context (number of cached tokens)
    pub async fn context_position(&self) -> usize {
        self.context.lock().await.position()
    }

    pub async fn set_generation_params(&self, params: GenerationParams) {
        *self.gen_params.lock().await = params;
    }

    pub async fn generation_params(&self) -> GenerationParams {
        self.gen_params.lock().await.clone()
    }

    pub async fn reset_context(&self) {
        let mut context = self.context.lock().await;
        context.reset();
        self.last_processed_tokens.lock().await.clear();
    }

    pub fn tokenize(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        // Chat templates already carry the BOS token.
        let encoding = self
            .model_tokenizer
            .encode(text, false)
            .map_err(|e| PipelineError::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Reject prompts that cannot fit in the model's context window.
    pub async fn check_prompt_length(&self, prompt_tokens: &[u32]) -> anyhow::Result<usize> {
        let max_seq_len = self.model.lock().await.get_max_seq_len();
        if prompt_tokens.len() > max_seq_len {
            return Err(PipelineError::ContextOverflow {
                prompt_tokens: prompt_tokens.len(),
                max_seq_len,
            }
            .into());
        }
        Ok(max_seq_len)
    }

    /// Generate a reply to `prompt_tokens` and decode it in one go.
    pub async fn completion_from_tokens(&self, prompt_tokens: &[u32]) -> anyhow::Result<String> {
        let max_seq_len = self.check_prompt_length(prompt_tokens).await?;
        let params = self.gen_params.lock().await.clone();
        let eos_tokens = self.model.lock().await.get_eos_tokens();

        let mut context = self.context.lock().await;
        let mut processed = self.last_processed_tokens.lock().await;

        let pending = pending_tokens(&mut *context, &mut processed, prompt_tokens);
        let mut logits = prefill(&mut *context, &pending, &self.device)?;
        processed.extend_from_slice(&pending);

        let mut logits_processor = initialize_logits_processor(&params, params.seed);
        let mut generated_tokens: Vec<u32> = Vec::with_capacity(params.max_len);

        while generated_tokens.len() < params.max_len {
            let penalized = apply_repeat_penalty(&logits, &params, &generated_tokens)?;
            let next_token = logits_processor.sample(&penalized)?;
            if eos_tokens.contains(&next_token) {
                break;
            }
            generated_tokens.push(next_token);

            if generated_tokens.len() >= params.max_len || context.position() >= max_seq_len {
                break;
            }
            logits = step(&mut *context, next_token, &self.device)?;
            processed.push(next_token);
        }

        tracing::debug!(
            generated = generated_tokens.len(),
            position = context.position(),
            "completion finished"
        );

        let text = self
            .model_tokenizer
            .decode(&generated_tokens, /*skip_special_tokens=*/ true)
            .map_err(|e| PipelineError::Tokenization(e.to_string()))?;

        Ok(text)
    }

    /// Streaming counterpart of [`completion_from_tokens`](Self::completion_from_tokens),
    /// yielding text as soon as it decodes cleanly.
    pub fn token_stream<'a>(
        &'a self,
        prompt_tokens: Vec<u32>,
    ) -> impl Stream<Item = anyhow::Result<String>> + Send + 'a
    where
        M: 'a,
    {
        try_stream! {
            let max_seq_len = self.check_prompt_length(&prompt_tokens).await?;
            let params = self.gen_params.lock().await.clone();
            let eos_tokens = self.model.lock().await.get_eos_tokens();

            let mut context = self.context.lock().await;
            let mut processed = self.last_processed_tokens.lock().await;

            let pending = pending_tokens(&mut *context, &mut processed, &prompt_tokens);
            let mut logits = prefill(&mut *context, &pending, &self.device)?;
            processed.extend_from_slice(&pending);

            let mut logits_processor = initialize_logits_processor(&params, params.seed);
            let mut generated_tokens: Vec<u32> = Vec::with_capacity(params.max_len);
            let mut decoder = self.model_tokenizer.decode_stream(true);

            while generated_tokens.len() < params.max_len {
                let penalized = apply_repeat_penalty(&logits, &params, &generated_tokens)?;
                let next_token = logits_processor.sample(&penalized)?;
                if eos_tokens.contains(&next_token) {
                    break;
                }
                generated_tokens.push(next_token);

                let chunk = decoder
                    .step(next_token)
                    .map_err(|e| PipelineError::Tokenization(e.to_string()))?;
                if let Some(chunk) = chunk {
                    yield chunk;
                }

                if generated_tokens.len() >= params.max_len || context.position() >= max_seq_len {
                    break;
                }
                logits = step(&mut *context, next_token, &self.device)?;
                processed.push(next_token);
            }

            tracing::debug!(
                generated = generated_tokens.len(),
                position = context.position(),
                "stream finished"
            );
        }
    }
}

/// Work out which prompt tokens still have to be fed to `context`.
///
/// When the prompt extends exactly what the context has already seen, only the
/// new suffix is returned. Otherwise the context is reset and the whole prompt
/// is returned. The result is never empty.
fn pending_tokens<C: LanguageModelContext>(
    context: &mut C,
    processed: &mut Vec<u32>,
    prompt_tokens: &[u32],
) -> Vec<u32> {
    let reusable = !processed.is_empty()
        && context.position() == processed.len()
        && prompt_tokens.len() > processed.len()
        && prompt_tokens.starts_with(processed.as_slice());

    if reusable {
        tracing::debug!(reused = processed.len(), "reusing kv cache");
        return prompt_tokens[processed.len()..].to_vec();
    }

    context.reset();
    processed.clear();
    prompt_tokens.to_vec()
}

/// Feed `tokens` in chunks and return the logits following the last one.
fn prefill<C: LanguageModelContext>(
    context: &mut C,
    tokens: &[u32],
    device: &Device,
) -> anyhow::Result<Tensor> {
    let mut last_logits = None;
    for chunk in tokens.chunks(PREFILL_CHUNK_SIZE) {
        let input = Tensor::new(chunk, device)?.unsqueeze(0)?;
        last_logits = Some(context.generate(&input)?.squeeze(0)?);
    }
    last_logits.ok_or_else(|| PipelineError::Tokenization("prompt encodes to no tokens".into()).into())
}

fn step<C: LanguageModelContext>(
    context: &mut C,
    token: u32,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let input = Tensor::new(&[token], device)?.unsqueeze(0)?;
    Ok(context.generate(&input)?.squeeze(0)?)
}
