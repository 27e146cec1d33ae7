pub mod components;
pub mod generation;
pub mod implementations;
pub mod source;

pub use implementations::LlamaModel;
pub use source::{ModelSource, PromptFormat, GORILLA_OPENFUNCTIONS_V2};
