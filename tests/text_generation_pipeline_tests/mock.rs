//! A tiny scripted model that drives the pipeline without downloading anything.
//!
//! The context replies with a fixed script: after any prompt token it predicts the
//! first script word, after script word `k` it predicts word `k + 1`, and after the
//! last one it predicts `<eos>`.

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use gorilla_chat::core::ModelOptions;
use gorilla_chat::models::generation::GenerationParams;
use gorilla_chat::pipelines::text_generation::{Function, LanguageModelContext, TextGenerationModel};
use gorilla_chat::Message;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokenizers::Tokenizer;

pub const CALL_TOKEN: &str = r#"get_weather(city="Paris")"#;

const VOCAB: &[&str] = &[
    "<unk>", "<eos>", "user", "assistant", "system", "functions", ":", "who", "are", "you", "?",
    "i", "am", "gorilla", CALL_TOKEN,
];
pub const EOS_ID: u32 = 1;

fn token_id(word: &str) -> u32 {
    VOCAB
        .iter()
        .position(|w| *w == word)
        .expect("script word is in the vocabulary") as u32
}

pub fn tokenizer() -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), serde_json::Value::from(id)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": EOS_ID,
            "content": "<eos>",
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    Tokenizer::from_str(&json.to_string()).unwrap()
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub key: String,
    pub script: Vec<&'static str>,
    pub max_seq_len: usize,
}

impl MockOptions {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            script: vec!["i", "am", "gorilla"],
            max_seq_len: 4096,
        }
    }

    pub fn script(mut self, script: &[&'static str]) -> Self {
        self.script = script.to_vec();
        self
    }

    pub fn max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }
}

impl ModelOptions for MockOptions {
    fn cache_key(&self) -> String {
        format!("mock/{}", self.key)
    }
}

#[derive(Clone)]
pub struct MockModel {
    options: MockOptions,
    resets: Arc<AtomicUsize>,
}

impl MockModel {
    pub fn new(options: MockOptions) -> Self {
        Self {
            options,
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How often any context of this model was reset.
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn prompt_len(&self, messages: &[Message]) -> usize {
        let prompt = self.apply_chat_template(messages, &[]).unwrap();
        tokenizer().encode(prompt, false).unwrap().len()
    }
}

pub struct MockContext {
    script: Vec<u32>,
    vocab_size: usize,
    position: usize,
    resets: Arc<AtomicUsize>,
}

impl LanguageModelContext for MockContext {
    fn generate(&mut self, input: &Tensor) -> candle_core::Result<Tensor> {
        let rows = input.to_vec2::<u32>()?;
        let last = *rows[0].last().expect("non-empty input");
        self.position += rows[0].len();

        let next = match self.script.iter().position(|&t| t == last) {
            Some(k) => self.script.get(k + 1).copied().unwrap_or(EOS_ID),
            None => self.script[0],
        };
        let mut logits = vec![0f32; self.vocab_size];
        logits[next as usize] = 10.0;
        Tensor::from_vec(logits, (1, self.vocab_size), input.device())
    }

    fn reset(&mut self) {
        self.position = 0;
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn position(&self) -> usize {
        self.position
    }
}

#[async_trait]
impl TextGenerationModel for MockModel {
    type Options = MockOptions;
    type Context = MockContext;

    async fn new(options: Self::Options, _device: Device) -> anyhow::Result<Self> {
        Ok(MockModel::new(options))
    }

    async fn get_tokenizer(&self) -> anyhow::Result<Tokenizer> {
        Ok(tokenizer())
    }

    fn apply_chat_template(&self, messages: &[Message], functions: &[Function]) -> anyhow::Result<String> {
        let mut prompt = String::new();
        if !functions.is_empty() {
            prompt.push_str("functions: ");
            for function in functions {
                prompt.push_str(&function.name);
                prompt.push(' ');
            }
            prompt.push('\n');
        }
        for message in messages {
            prompt.push_str(&format!("{}: {}\n", message.role(), message.content()));
        }
        prompt.push_str("assistant:");
        Ok(prompt)
    }

    fn get_eos_tokens(&self) -> Vec<u32> {
        vec![EOS_ID]
    }

    fn get_max_seq_len(&self) -> usize {
        self.options.max_seq_len
    }

    fn new_context(&self) -> MockContext {
        MockContext {
            script: self.options.script.iter().map(|w| token_id(w)).collect(),
            vocab_size: VOCAB.len(),
            position: 0,
            resets: self.resets.clone(),
        }
    }

    fn default_generation_params(&self) -> GenerationParams {
        GenerationParams::default()
    }
}
