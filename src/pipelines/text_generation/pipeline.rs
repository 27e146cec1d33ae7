use super::base_pipeline::BasePipeline;
use super::completion_stream::CompletionStream;
use super::functions::{parse_function_calls, Function, FunctionCompletion};
use super::model::TextGenerationModel;
use crate::core::PipelineError;
use crate::models::generation::GenerationParams;
use crate::Message;
use futures::Stream;
use serde::Serialize;

/// Input for a text-generation request.
#[derive(Debug, Clone)]
pub enum Input<'a> {
    /// A raw prompt string, sent as a single user turn.
    Prompt(&'a str),
    /// A sequence of chat messages.
    Messages(&'a [Message]),
}

impl<'a> From<&'a str> for Input<'a> {
    fn from(s: &'a str) -> Self {
        Self::Prompt(s)
    }
}

impl<'a> From<&'a [Message]> for Input<'a> {
    fn from(m: &'a [Message]) -> Self {
        Self::Messages(m)
    }
}

impl<'a> From<&'a Vec<Message>> for Input<'a> {
    fn from(v: &'a Vec<Message>) -> Self {
        Self::Messages(v.as_slice())
    }
}

impl<'a, const N: usize> From<&'a [Message; N]> for Input<'a> {
    fn from(m: &'a [Message; N]) -> Self {
        Self::Messages(m.as_slice())
    }
}

/// Result of running the pipeline on a conversation: the conversation with the
/// model's reply appended as an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextGenerationOutput {
    pub generated_text: Vec<Message>,
}

impl TextGenerationOutput {
    /// The assistant reply produced by this run.
    pub fn reply(&self) -> &str {
        self.generated_text
            .last()
            .map(Message::content)
            .unwrap_or_default()
    }
}

/// Text generation pipeline that outputs strings
pub struct TextGenerationPipeline<M: TextGenerationModel> {
    base: BasePipeline<M>,
}

impl<M: TextGenerationModel> TextGenerationPipeline<M> {
    pub async fn new(
        model: M,
        gen_params: GenerationParams,
        device: candle_core::Device,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base: BasePipeline::new(model, gen_params, device).await?,
        })
    }

    /// Get the current position in the context (number of cached tokens)
    pub async fn context_position(&self) -> usize {
        self.base.context_position().await
    }

    pub async fn set_generation_params(&self, params: GenerationParams) {
        self.base.set_generation_params(params).await;
    }

    pub async fn generation_params(&self) -> GenerationParams {
        self.base.generation_params().await
    }

    /// Return the maximum context length supported by the model.
    pub async fn max_context_length(&self) -> usize {
        self.base.model.lock().await.get_max_seq_len()
    }

    /// Forget the cached conversation; the next call starts from an empty context.
    pub async fn reset_context(&self) {
        self.base.reset_context().await;
    }

    /// Run the model on a conversation and return it with the reply appended.
    pub async fn generate(&self, messages: &[Message]) -> anyhow::Result<TextGenerationOutput> {
        let reply = self.completion(messages).await?;

        let mut generated_text = messages.to_vec();
        generated_text.push(Message::assistant(&reply));
        Ok(TextGenerationOutput { generated_text })
    }

    /// Generate a completion from either a prompt or a chat history.
    pub async fn completion<'a>(&self, input: impl Into<Input<'a>>) -> anyhow::Result<String> {
        let tokens = self.prompt_tokens(input.into(), &[]).await?;
        self.base.completion_from_tokens(&tokens).await
    }

    /// Streaming version of [`completion`](Self::completion).
    pub async fn completion_stream<'a>(
        &'a self,
        input: impl Into<Input<'a>>,
    ) -> anyhow::Result<CompletionStream<impl Stream<Item = anyhow::Result<String>> + Send + 'a>>
    where
        M: 'a,
    {
        let tokens = self.prompt_tokens(input.into(), &[]).await?;
        Ok(CompletionStream::new(self.base.token_stream(tokens)))
    }

    /// Offer `functions` to the model and parse the calls it answers with.
    ///
    /// A reply in prose comes back with no calls.
    pub async fn completion_with_functions<'a>(
        &self,
        input: impl Into<Input<'a>>,
        functions: &[Function],
    ) -> anyhow::Result<FunctionCompletion> {
        let tokens = self.prompt_tokens(input.into(), functions).await?;
        let text = self.base.completion_from_tokens(&tokens).await?;
        let calls = parse_function_calls(&text)?;
        tracing::debug!(calls = calls.len(), "parsed function calls");
        Ok(FunctionCompletion { text, calls })
    }

    async fn prompt_tokens(&self, input: Input<'_>, functions: &[Function]) -> anyhow::Result<Vec<u32>> {
        let prompt_message;
        let messages = match input {
            Input::Prompt(prompt) => {
                prompt_message = [Message::user(prompt)];
                &prompt_message[..]
            }
            Input::Messages(messages) => messages,
        };
        if messages.is_empty() {
            return Err(PipelineError::EmptyConversation.into());
        }

        let prompt = self
            .base
            .model
            .lock()
            .await
            .apply_chat_template(messages, functions)?;
        tracing::trace!(%prompt, "rendered prompt");

        let tokens = self.base.tokenize(&prompt)?;
        tracing::debug!(prompt_tokens = tokens.len(), "tokenized prompt");
        Ok(tokens)
    }
}
