pub mod params;
pub mod sampling;

pub use params::GenerationParams;
pub use sampling::{apply_repeat_penalty, initialize_logits_processor, LogitsProcessor};
