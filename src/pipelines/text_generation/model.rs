use super::functions::Function;
use crate::models::generation::GenerationParams;
use crate::Message;
use async_trait::async_trait;
use candle_core::Tensor;

/// Minimal interface required by the text-generation pipeline for a model context.
///
/// A context owns the KV cache of one conversation; the weights behind it are shared.
pub trait LanguageModelContext: Send {
    /// Forward the input tokens (`[batch, seq]`) through the model, returning the
    /// logits for the next token (`[batch, vocab]`).
    fn generate(&mut self, input: &Tensor) -> candle_core::Result<Tensor>;

    /// Clear the internal state (kv-cache, position, etc.).
    fn reset(&mut self);

    /// Number of tokens currently held in the cache.
    fn position(&self) -> usize;
}

#[async_trait]
pub trait TextGenerationModel: Send + Sync {
    /// Type used to configure model loading (e.g. which checkpoint).
    type Options: Send;
    /// The context type that will be returned by `new_context` and consumed by
    /// the pipeline.
    type Context: LanguageModelContext;

    async fn new(options: Self::Options, device: candle_core::Device) -> anyhow::Result<Self>
    where
        Self: Sized;

    async fn get_tokenizer(&self) -> anyhow::Result<tokenizers::Tokenizer>;

    /// Render the conversation into a prompt that ends where the assistant speaks.
    fn apply_chat_template(
        &self,
        messages: &[Message],
        functions: &[Function],
    ) -> anyhow::Result<String>;

    fn get_eos_tokens(&self) -> Vec<u32>;

    fn get_max_seq_len(&self) -> usize;

    fn new_context(&self) -> Self::Context;

    fn default_generation_params(&self) -> GenerationParams;
}
