//! Resolution of model identifiers to the Hub files that make up a model.

use crate::core::{ModelOptions, PipelineError};
use std::str::FromStr;

/// How conversations are turned into prompt text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFormat {
    /// The `### Instruction:` / `### Response:` format with `<<function>>`
    /// and `<<question>>` sections published for Gorilla OpenFunctions.
    /// Prompts that offer functions always use it.
    Gorilla,
    /// The `chat_template` shipped in the repo's `tokenizer_config.json`,
    /// or [`PromptFormat::Gorilla`] when the repo has none.
    TokenizerConfig,
}

/// Where to find the weights, tokenizer and configs for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub model_id: String,
    pub weights_repo: String,
    pub weights_file: String,
    /// Repo holding `tokenizer.json`, `tokenizer_config.json` and `generation_config.json`.
    pub tokenizer_repo: String,
    pub prompt_format: PromptFormat,
}

pub const GORILLA_OPENFUNCTIONS_V2: &str = "gorilla-llm/gorilla-openfunctions-v2";

struct RegisteredModel {
    model_id: &'static str,
    weights_repo: &'static str,
    weights_file: &'static str,
    tokenizer_repo: &'static str,
    prompt_format: PromptFormat,
}

const GORILLA: RegisteredModel = RegisteredModel {
    model_id: GORILLA_OPENFUNCTIONS_V2,
    weights_repo: "gorilla-llm/gorilla-openfunctions-v2-gguf",
    weights_file: "gorilla-openfunctions-v2-q4_K_M.gguf",
    tokenizer_repo: GORILLA_OPENFUNCTIONS_V2,
    prompt_format: PromptFormat::TokenizerConfig,
};

const REGISTRY: &[RegisteredModel] = &[GORILLA];

impl From<&RegisteredModel> for ModelSource {
    fn from(m: &RegisteredModel) -> Self {
        Self {
            model_id: m.model_id.to_string(),
            weights_repo: m.weights_repo.to_string(),
            weights_file: m.weights_file.to_string(),
            tokenizer_repo: m.tokenizer_repo.to_string(),
            prompt_format: m.prompt_format,
        }
    }
}

impl ModelSource {
    /// Gorilla OpenFunctions v2, 4-bit K-quant.
    pub fn gorilla_openfunctions_v2() -> Self {
        Self::from(&GORILLA)
    }

    /// Any Llama-architecture GGUF file on the Hub.
    pub fn gguf(weights_repo: &str, weights_file: &str, tokenizer_repo: &str) -> Self {
        Self {
            model_id: format!("{weights_repo}:{weights_file}"),
            weights_repo: weights_repo.to_string(),
            weights_file: weights_file.to_string(),
            tokenizer_repo: tokenizer_repo.to_string(),
            prompt_format: PromptFormat::TokenizerConfig,
        }
    }

    pub fn with_prompt_format(mut self, prompt_format: PromptFormat) -> Self {
        self.prompt_format = prompt_format;
        self
    }

    fn registered(model_id: &str) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|m| m.model_id == model_id)
            .map(Self::from)
    }
}

fn is_repo_id(s: &str) -> bool {
    let mut parts = s.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
    ) && !s.chars().any(char::is_whitespace)
}

impl FromStr for ModelSource {
    type Err = PipelineError;

    /// Accepts a registered id or `owner/repo:file.gguf`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(source) = Self::registered(s) {
            return Ok(source);
        }

        match s.split_once(':') {
            Some((repo, file)) if is_repo_id(repo) && file.ends_with(".gguf") && !file.contains('/') => {
                Ok(Self::gguf(repo, file, repo))
            }
            _ => Err(PipelineError::UnknownModel(s.to_string())),
        }
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.model_id)
    }
}

impl ModelOptions for ModelSource {
    fn cache_key(&self) -> String {
        // The prompt format decides the loaded templates, so it is part of the key.
        format!("{}/{}@{:?}", self.weights_repo, self.weights_file, self.prompt_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_gorilla_id() {
        let source: ModelSource = "gorilla-llm/gorilla-openfunctions-v2".parse().unwrap();
        assert_eq!(source.weights_repo, "gorilla-llm/gorilla-openfunctions-v2-gguf");
        assert_eq!(source.weights_file, "gorilla-openfunctions-v2-q4_K_M.gguf");
        assert_eq!(source.tokenizer_repo, "gorilla-llm/gorilla-openfunctions-v2");
        assert_eq!(source.prompt_format, PromptFormat::TokenizerConfig);
        assert_eq!(source, ModelSource::gorilla_openfunctions_v2());
    }

    #[test]
    fn prompt_format_override_keeps_the_files() {
        let default = ModelSource::gorilla_openfunctions_v2();
        let source = default.clone().with_prompt_format(PromptFormat::Gorilla);
        assert_eq!(source.prompt_format, PromptFormat::Gorilla);
        assert_eq!(source.weights_file, default.weights_file);
        assert_ne!(source.cache_key(), default.cache_key());
    }

    #[test]
    fn resolves_explicit_gguf_file() {
        let source: ModelSource = "someone/llama-gguf:model-Q4_K_M.gguf".parse().unwrap();
        assert_eq!(source.weights_repo, "someone/llama-gguf");
        assert_eq!(source.tokenizer_repo, "someone/llama-gguf");
        assert_eq!(source.prompt_format, PromptFormat::TokenizerConfig);
        assert_eq!(source.to_string(), "someone/llama-gguf:model-Q4_K_M.gguf");
    }

    #[test]
    fn rejects_unresolvable_ids() {
        for id in [
            "",
            "gorilla",
            "not/a/repo:x.gguf",
            "owner/repo",
            "owner/repo:weights.bin",
            "owner/repo:dir/x.gguf",
        ] {
            let err = id.parse::<ModelSource>().unwrap_err();
            assert!(matches!(err, PipelineError::UnknownModel(_)), "{id}");
        }
    }

    #[test]
    fn cache_key_identifies_weights() {
        assert_eq!(
            ModelSource::gorilla_openfunctions_v2().cache_key(),
            "gorilla-llm/gorilla-openfunctions-v2-gguf/gorilla-openfunctions-v2-q4_K_M.gguf@TokenizerConfig"
        );
    }
}
