//! Run Gorilla OpenFunctions (and other Llama-architecture GGUF models) locally
//! through a Hugging Face style `pipeline("text-generation", model)` API.

pub mod core;
mod loaders;
pub mod models;
pub mod pipelines;

// Re-export core types
pub use crate::core::{Message, MessageVecExt, PipelineError, Role};

pub use models::{LlamaModel, ModelSource, PromptFormat, GORILLA_OPENFUNCTIONS_V2};
pub use pipelines::utils::DeviceSelectable;
pub use pipelines::{
    pipeline, Function, FunctionCall, FunctionCompletion, Task, TextGenerationOutput,
    TextGenerationPipeline, TextGenerationPipelineBuilder,
};
