/// Sampling defaults published alongside a model in `generation_config.json`.
///
/// Every field is optional; the model decides what to fall back to.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub min_p: Option<f64>,
    pub repeat_penalty: Option<f32>,
    pub repeat_last_n: Option<usize>,
    pub do_sample: Option<bool>,
    pub max_new_tokens: Option<usize>,
    pub eos_token_ids: Vec<u64>,
}

/// The subset of `tokenizer_config.json` needed to render prompts.
#[derive(Debug, Clone, Default)]
pub struct TokenizerConfig {
    pub chat_template: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
}
