use thiserror::Error;

/// Typed failures raised by the pipeline.
///
/// Public functions return [`anyhow::Result`]; these variants sit at the root of
/// the chain so callers can `downcast_ref::<PipelineError>()` to branch on them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// The task string does not name a supported task.
    #[error("unsupported task '{0}', expected \"text-generation\"")]
    UnsupportedTask(String),

    /// The model identifier cannot be resolved to weights and a tokenizer.
    #[error("unknown model '{0}', use a registered id or the form 'owner/repo:file.gguf'")]
    UnknownModel(String),

    /// The GGUF file describes an architecture this crate cannot run.
    #[error("unsupported model architecture '{0}'")]
    UnsupportedArchitecture(String),

    /// A required GGUF metadata key is absent.
    #[error("missing '{0}' in model metadata")]
    MissingMetadata(String),

    /// Fetching a file from the Hugging Face Hub failed.
    #[error("failed to download '{file}' from '{repo}': {reason}")]
    Download {
        repo: String,
        file: String,
        reason: String,
    },

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("chat template error: {0}")]
    ChatTemplate(String),

    /// The conversation handed to the pipeline has no messages.
    #[error("conversation must contain at least one message")]
    EmptyConversation,

    /// The prompt alone does not fit into the model's context window.
    #[error("prompt of {prompt_tokens} tokens exceeds the context length of {max_seq_len}")]
    ContextOverflow {
        prompt_tokens: usize,
        max_seq_len: usize,
    },

    /// The model never signals the end of its turn.
    #[error("no end-of-sequence token could be determined for '{0}'")]
    NoEosToken(String),

    #[error("malformed function call at byte {position}: {reason}")]
    FunctionCallParse { position: usize, reason: String },
}

