pub mod cache;
pub mod config;
pub mod error;
pub mod message;

pub use cache::{global_cache, ModelCache, ModelOptions};
pub use config::{GenerationConfig, TokenizerConfig};
pub use error::PipelineError;
pub use message::{Message, MessageVecExt, Role};
