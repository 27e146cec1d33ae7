pub mod llama;

pub use llama::{ChatTemplate, Context, LlamaModel, ModelWeights, PromptTemplates};
