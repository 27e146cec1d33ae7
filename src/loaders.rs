//! Loaders for the files a model needs from the Hugging Face Hub.
//!
//! - [`HfLoader`] - downloads one file into the local Hub cache, with retry
//! - [`TokenizerLoader`] - `tokenizer.json`
//! - [`GenerationConfigLoader`] - `generation_config.json`
//! - [`TokenizerConfigLoader`] - `tokenizer_config.json` (chat template, special tokens)
//! - [`GgufModelLoader`] - quantized weights in GGUF format
//!
//! Files already present in the cache are not downloaded again.

use crate::core::{GenerationConfig, PipelineError, TokenizerConfig};
use serde::Deserialize;
use std::path::PathBuf;
use tokenizers::Tokenizer;

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct HfLoader {
    pub repo: String,
    pub filename: String,
}

impl HfLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            repo: repo.into(),
            filename: filename.into(),
        }
    }

    fn download_error(&self, reason: impl ToString) -> PipelineError {
        PipelineError::Download {
            repo: self.repo.clone(),
            file: self.filename.clone(),
            reason: reason.to_string(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<PathBuf> {
        let hf_api = hf_hub::api::tokio::ApiBuilder::new()
            .with_chunk_size(None)
            .build()
            .map_err(|e| self.download_error(e))?;
        let hf_api = hf_api.model(self.repo.clone());

        let mut attempt = 0;
        loop {
            match hf_api.get(self.filename.as_str()).await {
                Ok(path) => {
                    tracing::debug!(repo = %self.repo, file = %self.filename, path = %path.display(), "resolved hub file");
                    return Ok(path);
                }
                Err(e) => {
                    let error_msg = e.to_string();
                    attempt += 1;
                    // Concurrent downloads of the same file contend for the cache lock.
                    if error_msg.contains("Lock acquisition failed") && attempt < MAX_RETRIES {
                        let wait_time = std::time::Duration::from_millis(100 * (1 << (attempt - 1)));
                        tracing::debug!(repo = %self.repo, file = %self.filename, attempt, "hub lock busy, retrying");
                        tokio::time::sleep(wait_time).await;
                        continue;
                    }
                    return Err(self.download_error(error_msg).into());
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenizerLoader {
    pub tokenizer_file_loader: HfLoader,
}

impl TokenizerLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            tokenizer_file_loader: HfLoader::new(repo, filename),
        }
    }

    pub async fn load(&self) -> anyhow::Result<Tokenizer> {
        let tokenizer_file_path = self.tokenizer_file_loader.load().await?;

        let tokenizer = Tokenizer::from_file(tokenizer_file_path)
            .map_err(|e| PipelineError::Tokenization(e.to_string()))?;

        Ok(tokenizer)
    }
}

pub struct GenerationConfigLoader {
    pub generation_config_file_loader: HfLoader,
}

#[derive(Deserialize)]
struct RawGenerationConfig {
    temperature: Option<f64>,
    top_p: Option<f64>,
    top_k: Option<u64>,
    min_p: Option<f64>,
    /// Hugging Face spelling; wins over `repeat_penalty` when both are present.
    repetition_penalty: Option<f32>,
    repeat_penalty: Option<f32>,
    repeat_last_n: Option<usize>,
    do_sample: Option<bool>,
    max_new_tokens: Option<usize>,
    eos_token_id: Option<serde_json::Value>,
}

impl GenerationConfigLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            generation_config_file_loader: HfLoader::new(repo, filename),
        }
    }

    pub async fn load(&self) -> anyhow::Result<GenerationConfig> {
        let path = self.generation_config_file_loader.load().await?;
        let content = std::fs::read_to_string(path)?;
        parse_generation_config(&content)
    }
}

pub(crate) fn parse_generation_config(content: &str) -> anyhow::Result<GenerationConfig> {
    let raw: RawGenerationConfig = serde_json::from_str(content)?;

    let eos_token_ids = match raw.eos_token_id {
        Some(serde_json::Value::Number(n)) => vec![n
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("Invalid EOS token ID"))?],
        Some(serde_json::Value::Array(arr)) => arr
            .into_iter()
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| anyhow::anyhow!("Invalid EOS token ID in array"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };

    Ok(GenerationConfig {
        temperature: raw.temperature,
        top_p: raw.top_p,
        top_k: raw.top_k,
        min_p: raw.min_p,
        repeat_penalty: raw.repetition_penalty.or(raw.repeat_penalty),
        repeat_last_n: raw.repeat_last_n,
        do_sample: raw.do_sample,
        max_new_tokens: raw.max_new_tokens,
        eos_token_ids,
    })
}

pub struct TokenizerConfigLoader {
    pub tokenizer_config_file_loader: HfLoader,
}

/// Special tokens appear either as plain strings or as `AddedToken` objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSpecialToken {
    Plain(String),
    Added { content: String },
}

impl RawSpecialToken {
    fn into_content(self) -> String {
        match self {
            RawSpecialToken::Plain(s) => s,
            RawSpecialToken::Added { content } => content,
        }
    }
}

#[derive(Deserialize)]
struct RawTokenizerConfig {
    chat_template: Option<serde_json::Value>,
    bos_token: Option<RawSpecialToken>,
    eos_token: Option<RawSpecialToken>,
}

impl TokenizerConfigLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            tokenizer_config_file_loader: HfLoader::new(repo, filename),
        }
    }

    pub async fn load(&self) -> anyhow::Result<TokenizerConfig> {
        let path = self.tokenizer_config_file_loader.load().await?;
        let content = std::fs::read_to_string(path)?;
        parse_tokenizer_config(&content)
    }
}

pub(crate) fn parse_tokenizer_config(content: &str) -> anyhow::Result<TokenizerConfig> {
    let raw: RawTokenizerConfig = serde_json::from_str(content)?;

    // Newer repos ship a list of named templates; "default" is the chat one.
    let chat_template = match raw.chat_template {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Array(templates)) => templates.iter().find_map(|t| {
            (t["name"].as_str() == Some("default"))
                .then(|| t["template"].as_str().map(str::to_string))
                .flatten()
        }),
        _ => None,
    };

    Ok(TokenizerConfig {
        chat_template,
        bos_token: raw.bos_token.map(RawSpecialToken::into_content),
        eos_token: raw.eos_token.map(RawSpecialToken::into_content),
    })
}

#[derive(Debug, Clone)]
pub struct GgufModelLoader {
    pub model_file_loader: HfLoader,
}

impl GgufModelLoader {
    pub fn new(model_repo: &str, model_filename: &str) -> Self {
        Self {
            model_file_loader: HfLoader::new(model_repo, model_filename),
        }
    }

    pub async fn load(
        &self,
    ) -> anyhow::Result<(std::fs::File, candle_core::quantized::gguf_file::Content)> {
        let model_file_path = self.model_file_loader.load().await?;

        let mut file = std::fs::File::open(&model_file_path)?;
        let file_content = candle_core::quantized::gguf_file::Content::read(&mut file)
            .map_err(|e| e.with_path(model_file_path))?;

        Ok((file, file_content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_config_accepts_single_eos_id() {
        let cfg = parse_generation_config(
            r#"{"bos_token_id": 100000, "eos_token_id": 100015, "do_sample": false}"#,
        )
        .unwrap();
        assert_eq!(cfg.eos_token_ids, vec![100015]);
        assert_eq!(cfg.do_sample, Some(false));
        assert!(cfg.temperature.is_none());
    }

    #[test]
    fn generation_config_accepts_eos_id_list_and_hf_aliases() {
        let cfg = parse_generation_config(
            r#"{"eos_token_id": [1, 2], "repetition_penalty": 1.05, "temperature": 0.3}"#,
        )
        .unwrap();
        assert_eq!(cfg.eos_token_ids, vec![1, 2]);
        assert_eq!(cfg.repeat_penalty, Some(1.05));
        assert_eq!(cfg.temperature, Some(0.3));
    }

    #[test]
    fn generation_config_prefers_hf_penalty_spelling() {
        let cfg = parse_generation_config(
            r#"{"repeat_penalty": 1.3, "repetition_penalty": 1.1, "do_sample": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.repeat_penalty, Some(1.1));
        assert_eq!(cfg.do_sample, Some(true));

        let cfg = parse_generation_config(r#"{"repeat_penalty": 1.3}"#).unwrap();
        assert_eq!(cfg.repeat_penalty, Some(1.3));
    }

    #[test]
    fn generation_config_rejects_negative_eos_id() {
        assert!(parse_generation_config(r#"{"eos_token_id": -1}"#).is_err());
    }

    #[test]
    fn tokenizer_config_reads_added_token_objects() {
        let cfg = parse_tokenizer_config(
            r#"{
                "bos_token": {"content": "<s>", "lstrip": false},
                "eos_token": "<|EOT|>",
                "chat_template": "{{ messages }}"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.bos_token.as_deref(), Some("<s>"));
        assert_eq!(cfg.eos_token.as_deref(), Some("<|EOT|>"));
        assert_eq!(cfg.chat_template.as_deref(), Some("{{ messages }}"));
    }

    #[test]
    fn tokenizer_config_picks_default_from_named_templates() {
        let cfg = parse_tokenizer_config(
            r#"{"chat_template": [
                {"name": "tool_use", "template": "tools"},
                {"name": "default", "template": "chat"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(cfg.chat_template.as_deref(), Some("chat"));
        assert!(cfg.eos_token.is_none());
    }
}
