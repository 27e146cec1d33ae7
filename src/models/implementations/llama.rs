//! Quantized Llama-architecture models loaded from GGUF.
//!
//! Gorilla OpenFunctions v2 is a Llama-architecture model; any other GGUF export
//! with `general.architecture = llama` loads through the same path.
//!
//! - [`ModelWeights`] - immutable weights, shared between contexts
//! - [`Context`] - one conversation's KV caches and position
//! - [`ChatTemplate`] - conversation to prompt rendering
//! - [`LlamaModel`] - ties the above to a tokenizer and generation defaults

use crate::core::{GenerationConfig, PipelineError, TokenizerConfig};
use crate::loaders::{
    GenerationConfigLoader, GgufModelLoader, TokenizerConfigLoader, TokenizerLoader,
};
use crate::models::components::{
    causal_mask, Attention, AttentionConfig, Embedding, FeedForward, KvCache, QMatMul, RmsNorm,
    RotaryEmbedding,
};
use crate::models::generation::GenerationParams;
use crate::models::source::{ModelSource, PromptFormat};
use crate::pipelines::text_generation::{
    Function, LanguageModelContext, TextGenerationModel,
};
use crate::{Message, Role};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Module, Tensor};
use minijinja::{context, Environment, ErrorKind, UndefinedBehavior};
use minijinja_contrib::pycompat;
use std::collections::HashMap;
use std::io::{Read, Seek};
use std::sync::Arc;
use tokenizers::Tokenizer;

const DEFAULT_CONTEXT_LENGTH: u32 = 4096;
const DEFAULT_ROPE_FREQ_BASE: f32 = 10_000.0;

/// End-of-turn markers used by Gorilla and its DeepSeek base.
const END_OF_TURN_TOKENS: &[&str] = &["<|EOT|>", "<｜end▁of▁sentence｜>"];

pub const GORILLA_SYSTEM_PROMPT: &str = "You are an AI programming assistant, utilizing the Gorilla LLM model, developed by Gorilla LLM, and you only answer questions related to computer science. For politically sensitive questions, security and privacy issues, and other non-computer science questions, you will refuse to answer.";

fn metadata_value<'a>(
    metadata: &'a HashMap<String, gguf_file::Value>,
    key: &str,
) -> anyhow::Result<&'a gguf_file::Value> {
    metadata
        .get(key)
        .ok_or_else(|| PipelineError::MissingMetadata(key.to_string()).into())
}

fn metadata_u32(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> anyhow::Result<u32> {
    Ok(metadata_value(metadata, key)?.to_u32()?)
}

fn metadata_f32(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> anyhow::Result<f32> {
    Ok(metadata_value(metadata, key)?.to_f32()?)
}

/// Pre-norm transformer block.
#[derive(Debug)]
struct TransformerLayer {
    attention: Attention,
    feed_forward: FeedForward,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
    span: tracing::Span,
}

impl TransformerLayer {
    fn load<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        layer_idx: usize,
        config: AttentionConfig,
        rotary: Arc<RotaryEmbedding>,
        rms_eps: f64,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let prefix = format!("blk.{layer_idx}");

        let attention = Attention::load(content, reader, &prefix, config, rotary, device)?;
        let feed_forward = FeedForward::load(content, reader, &prefix, device)?;
        let attention_norm = RmsNorm::from_qtensor(
            content.tensor(reader, &format!("{prefix}.attn_norm.weight"), device)?,
            rms_eps,
        )?;
        let ffn_norm = RmsNorm::from_qtensor(
            content.tensor(reader, &format!("{prefix}.ffn_norm.weight"), device)?,
            rms_eps,
        )?;

        Ok(Self {
            attention,
            feed_forward,
            attention_norm,
            ffn_norm,
            span: tracing::span!(tracing::Level::TRACE, "layer", idx = layer_idx),
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        position_offset: usize,
        kv_cache: &mut KvCache,
    ) -> candle_core::Result<Tensor> {
        let _enter = self.span.enter();

        let normed = self.attention_norm.forward(hidden_states)?;
        let attention_out =
            self.attention
                .forward(&normed, attention_mask, position_offset, kv_cache)?;
        let hidden_states = (hidden_states + attention_out)?;

        let normed = self.ffn_norm.forward(&hidden_states)?;
        let ffn_out = self.feed_forward.forward(&normed)?;
        hidden_states + ffn_out
    }
}

/// Model weights for every layer. Immutable once loaded.
pub struct ModelWeights {
    embeddings: Embedding,
    layers: Vec<TransformerLayer>,
    final_norm: RmsNorm,
    output_projection: QMatMul,
    device: Device,
    max_seq_len: usize,
    eos_token_id: Option<u32>,
}

impl ModelWeights {
    /// Load model weights from GGUF format.
    pub fn from_gguf<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let metadata = &content.metadata;

        let architecture = metadata_value(metadata, "general.architecture")?
            .to_string()?
            .clone();
        if architecture != "llama" {
            return Err(PipelineError::UnsupportedArchitecture(architecture).into());
        }

        let num_layers = metadata_u32(metadata, "llama.block_count")? as usize;
        let num_heads = metadata_u32(metadata, "llama.attention.head_count")? as usize;
        let num_kv_heads = metadata_u32(metadata, "llama.attention.head_count_kv")? as usize;
        let embedding_length = metadata_u32(metadata, "llama.embedding_length")? as usize;
        let rms_eps = metadata_f32(metadata, "llama.attention.layer_norm_rms_epsilon")? as f64;
        let head_dim = metadata
            .get("llama.rope.dimension_count")
            .and_then(|v| v.to_u32().ok())
            .map(|v| v as usize)
            .unwrap_or(embedding_length / num_heads);
        let rope_freq_base = metadata
            .get("llama.rope.freq_base")
            .and_then(|v| v.to_f32().ok())
            .unwrap_or(DEFAULT_ROPE_FREQ_BASE);
        let rope_scaling = metadata
            .get("llama.rope.scaling.factor")
            .and_then(|v| v.to_f32().ok())
            .unwrap_or(1.0);
        let max_seq_len = metadata
            .get("llama.context_length")
            .and_then(|v| v.to_u32().ok())
            .unwrap_or(DEFAULT_CONTEXT_LENGTH) as usize;
        let eos_token_id = metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|v| v.to_u32().ok());

        tracing::info!(
            num_layers,
            num_heads,
            num_kv_heads,
            head_dim,
            max_seq_len,
            "loading llama weights"
        );

        let rotary = Arc::new(RotaryEmbedding::new(
            head_dim,
            rope_freq_base,
            rope_scaling,
            max_seq_len,
            device,
        )?);

        let token_embd = content.tensor(reader, "token_embd.weight", device)?;
        let embeddings = Embedding::from_qtensor(&token_embd, device)?;

        let attention_config = AttentionConfig {
            num_heads,
            num_kv_heads,
            head_dim,
        };
        let mut layers = Vec::with_capacity(num_layers);
        for layer_idx in 0..num_layers {
            layers.push(TransformerLayer::load(
                content,
                reader,
                layer_idx,
                attention_config,
                rotary.clone(),
                rms_eps,
                device,
            )?);
        }

        let final_norm = RmsNorm::from_qtensor(
            content.tensor(reader, "output_norm.weight", device)?,
            rms_eps,
        )?;
        // Models with tied embeddings ship no separate output matrix.
        let output_projection = if content.tensor_infos.contains_key("output.weight") {
            QMatMul::load(content, reader, "output.weight", device)?
        } else {
            QMatMul::from_qtensor(token_embd)?
        };

        Ok(Self {
            embeddings,
            layers,
            final_norm,
            output_projection,
            device: device.clone(),
            max_seq_len,
            eos_token_id,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}

/// A single inference context with independent state.
/// Multiple contexts can share the same model weights.
pub struct Context {
    weights: Arc<ModelWeights>,
    kv_caches: Vec<KvCache>,
    position: usize,
}

impl Context {
    pub fn new(weights: Arc<ModelWeights>) -> Self {
        let kv_caches = (0..weights.num_layers()).map(|_| KvCache::new()).collect();
        Self {
            weights,
            kv_caches,
            position: 0,
        }
    }

    /// Feed `input_ids` (`[batch, seq]`) after everything already in the cache and
    /// return the next-token logits (`[batch, vocab]`).
    pub fn generate(&mut self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (_batch_size, seq_len) = input_ids.dims2()?;
        let position_offset = self.position;

        if position_offset + seq_len > self.weights.max_seq_len {
            candle_core::bail!(
                "context length exceeded: {} + {} > {}",
                position_offset,
                seq_len,
                self.weights.max_seq_len
            );
        }

        let mut hidden_states = self.weights.embeddings.forward(input_ids)?;

        // A single new token may attend to everything before it.
        let attention_mask = if seq_len > 1 {
            Some(causal_mask(seq_len, position_offset, &self.weights.device)?)
        } else {
            None
        };

        for (layer, kv_cache) in self.weights.layers.iter().zip(self.kv_caches.iter_mut()) {
            hidden_states = layer.forward(
                &hidden_states,
                attention_mask.as_ref(),
                position_offset,
                kv_cache,
            )?;
        }

        let hidden_states = self.weights.final_norm.forward(&hidden_states)?;
        let last_hidden = hidden_states.narrow(1, seq_len - 1, 1)?;
        let logits = self
            .weights
            .output_projection
            .forward(&last_hidden)?
            .squeeze(1)?;

        self.position += seq_len;

        Ok(logits)
    }

    pub fn reset(&mut self) {
        for cache in &mut self.kv_caches {
            cache.reset();
        }
        self.position = 0;
    }
}

impl LanguageModelContext for Context {
    fn generate(&mut self, input: &Tensor) -> candle_core::Result<Tensor> {
        Context::generate(self, input)
    }

    fn reset(&mut self) {
        Context::reset(self);
    }

    fn position(&self) -> usize {
        self.position
    }
}

/// The prompt format Gorilla OpenFunctions was trained on.
const GORILLA_TEMPLATE: &str = r####"
{{- bos_token ~ system ~ "\n" -}}
{%- for message in messages -%}
  {%- if message.role == "user" -%}
    {%- if loop.index0 == last_user_index and functions -%}
      {{- "### Instruction: <<function>>" ~ functions ~ "\n<<question>>" ~ message.content ~ "\n" -}}
    {%- else -%}
      {{- "### Instruction: <<question>> " ~ message.content ~ "\n" -}}
    {%- endif -%}
  {%- else -%}
    {{- "### Response: " ~ message.content ~ "\n<|EOT|>\n" -}}
  {%- endif -%}
{%- endfor -%}
{%- if add_generation_prompt -%}
  {{- "### Response: " -}}
{%- endif -%}
"####;

const TEMPLATE_NAME: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateKind {
    Gorilla,
    Repo,
}

/// Renders a conversation into the prompt text a model expects.
pub struct ChatTemplate {
    env: Environment<'static>,
    kind: TemplateKind,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    /// The Gorilla `### Instruction:` / `### Response:` format.
    pub fn gorilla(config: &TokenizerConfig) -> anyhow::Result<Self> {
        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, GORILLA_TEMPLATE)
            .map_err(|e| PipelineError::ChatTemplate(e.to_string()))?;
        Ok(Self::with_env(env, TemplateKind::Gorilla, config))
    }

    /// The repo's own `chat_template`, or the Gorilla format when it has none.
    pub fn from_tokenizer_config(config: &TokenizerConfig) -> anyhow::Result<Self> {
        let Some(template) = config.chat_template.as_deref() else {
            tracing::debug!("no chat_template in tokenizer config, using the Gorilla format");
            return Self::gorilla(config);
        };

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env.set_unknown_method_callback(pycompat::unknown_method_callback);
        env.add_filter("tojson", minijinja::filters::tojson);
        env.add_function("raise_exception", |message: String| -> Result<String, minijinja::Error> {
            Err(minijinja::Error::new(
                ErrorKind::InvalidOperation,
                format!("chat template raised an exception: {message}"),
            ))
        });

        // Leak the string to get 'static lifetime; it lives as long as the model.
        let template: &'static str = Box::leak(patch_python_isms(template).into_boxed_str());
        env.add_template(TEMPLATE_NAME, template)
            .map_err(|e| PipelineError::ChatTemplate(e.to_string()))?;

        Ok(Self::with_env(env, TemplateKind::Repo, config))
    }

    fn with_env(env: Environment<'static>, kind: TemplateKind, config: &TokenizerConfig) -> Self {
        Self {
            env,
            kind,
            bos_token: config.bos_token.clone().unwrap_or_default(),
            eos_token: config.eos_token.clone().unwrap_or_default(),
        }
    }

    /// Render `messages` followed by the assistant generation prompt.
    ///
    /// Only the Gorilla format has a place for `functions`; repo templates ignore them.
    pub fn render(&self, messages: &[Message], functions: &[Function]) -> anyhow::Result<String> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| PipelineError::ChatTemplate(e.to_string()))?;

        let rendered = match self.kind {
            TemplateKind::Gorilla => {
                let system = messages
                    .iter()
                    .find(|m| m.role() == Role::System)
                    .map(Message::content)
                    .unwrap_or(GORILLA_SYSTEM_PROMPT);
                let turns: Vec<&Message> =
                    messages.iter().filter(|m| m.role() != Role::System).collect();
                let last_user_index = turns.iter().rposition(|m| m.role() == Role::User);
                let functions = if functions.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(functions)?
                };

                template.render(context! {
                    bos_token => self.bos_token,
                    system => system,
                    messages => turns,
                    last_user_index => last_user_index,
                    functions => functions,
                    add_generation_prompt => true,
                })
            }
            TemplateKind::Repo => template.render(context! {
                messages => messages,
                bos_token => self.bos_token,
                eos_token => self.eos_token,
                add_generation_prompt => true,
            }),
        };

        rendered.map_err(|e| PipelineError::ChatTemplate(e.to_string()).into())
    }
}

/// The conversation template, and the Gorilla format for prompts that offer
/// functions, since only it carries the `<<function>>` section.
pub struct PromptTemplates {
    chat: ChatTemplate,
    functions: ChatTemplate,
}

impl PromptTemplates {
    pub fn new(format: PromptFormat, config: &TokenizerConfig) -> anyhow::Result<Self> {
        let chat = match format {
            PromptFormat::Gorilla => ChatTemplate::gorilla(config)?,
            PromptFormat::TokenizerConfig => ChatTemplate::from_tokenizer_config(config)?,
        };
        Ok(Self {
            chat,
            functions: ChatTemplate::gorilla(config)?,
        })
    }

    pub fn render(&self, messages: &[Message], functions: &[Function]) -> anyhow::Result<String> {
        if functions.is_empty() {
            self.chat.render(messages, functions)
        } else {
            self.functions.render(messages, functions)
        }
    }
}

/// Rewrite Python expressions that minijinja does not understand.
fn patch_python_isms(template: &str) -> String {
    template
        .replace("messages[::-1]", "messages|reverse")
        .replace(
            "(messages|length - 1) - loop.index0",
            "((messages|length - 1)|int - loop.index0|int)",
        )
        .replace("messages[-1]", "messages[(messages|length - 1)]")
}

/// Every id that ends the assistant's turn, in discovery order without repeats.
fn collect_eos_tokens(
    generation_config: &GenerationConfig,
    gguf_eos: Option<u32>,
    tokenizer_config: &TokenizerConfig,
    tokenizer: &Tokenizer,
) -> Vec<u32> {
    let from_config = generation_config.eos_token_ids.iter().map(|&id| id as u32);
    let from_strings = END_OF_TURN_TOKENS
        .iter()
        .copied()
        .chain(tokenizer_config.eos_token.as_deref())
        .filter_map(|token| tokenizer.token_to_id(token));

    let mut eos_tokens = Vec::new();
    for id in from_config.chain(gguf_eos).chain(from_strings) {
        if !eos_tokens.contains(&id) {
            eos_tokens.push(id);
        }
    }
    eos_tokens
}

/// A quantized Llama-architecture chat model.
#[derive(Clone)]
pub struct LlamaModel {
    weights: Arc<ModelWeights>,
    tokenizer: Tokenizer,
    generation_config: GenerationConfig,
    eos_tokens: Vec<u32>,
    templates: Arc<PromptTemplates>,
}

impl LlamaModel {
    /// Download (or reuse from the Hub cache) and load everything `source` names.
    pub async fn from_hf(source: ModelSource, device: &Device) -> anyhow::Result<Self> {
        tracing::info!(model = %source, "loading model");

        let (mut file, content) =
            GgufModelLoader::new(&source.weights_repo, &source.weights_file)
                .load()
                .await?;
        let weights = Arc::new(ModelWeights::from_gguf(&content, &mut file, device)?);

        let tokenizer = TokenizerLoader::new(&source.tokenizer_repo, "tokenizer.json")
            .load()
            .await?;

        let generation_config =
            match GenerationConfigLoader::new(&source.tokenizer_repo, "generation_config.json")
                .load()
                .await
            {
                Ok(config) => config,
                Err(e) => {
                    tracing::debug!(error = %e, "no usable generation_config.json, using defaults");
                    GenerationConfig::default()
                }
            };

        let tokenizer_config =
            match TokenizerConfigLoader::new(&source.tokenizer_repo, "tokenizer_config.json")
                .load()
                .await
            {
                Ok(config) => config,
                Err(e) => {
                    tracing::debug!(error = %e, "no usable tokenizer_config.json, using defaults");
                    TokenizerConfig::default()
                }
            };

        let eos_tokens = collect_eos_tokens(
            &generation_config,
            weights.eos_token_id,
            &tokenizer_config,
            &tokenizer,
        );
        if eos_tokens.is_empty() {
            return Err(PipelineError::NoEosToken(source.model_id.clone()).into());
        }

        let templates = PromptTemplates::new(source.prompt_format, &tokenizer_config)?;

        tracing::info!(model = %source, ?eos_tokens, "model ready");

        Ok(Self {
            weights,
            tokenizer,
            generation_config,
            eos_tokens,
            templates: Arc::new(templates),
        })
    }
}

#[async_trait]
impl TextGenerationModel for LlamaModel {
    type Options = ModelSource;
    type Context = Context;

    async fn new(options: Self::Options, device: Device) -> anyhow::Result<Self> {
        LlamaModel::from_hf(options, &device).await
    }

    async fn get_tokenizer(&self) -> anyhow::Result<Tokenizer> {
        Ok(self.tokenizer.clone())
    }

    fn apply_chat_template(
        &self,
        messages: &[Message],
        functions: &[Function],
    ) -> anyhow::Result<String> {
        self.templates.render(messages, functions)
    }

    fn get_eos_tokens(&self) -> Vec<u32> {
        self.eos_tokens.clone()
    }

    fn get_max_seq_len(&self) -> usize {
        self.weights.max_seq_len()
    }

    fn new_context(&self) -> Context {
        Context::new(self.weights.clone())
    }

    fn default_generation_params(&self) -> GenerationParams {
        GenerationParams::from_config(&self.generation_config)
    }
}
