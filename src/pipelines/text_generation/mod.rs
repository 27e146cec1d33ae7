pub mod base_pipeline;
pub mod builder;
pub mod completion_stream;
pub mod functions;
pub mod model;
pub mod pipeline;

pub use builder::TextGenerationPipelineBuilder;
pub use completion_stream::CompletionStream;
pub use functions::{parse_function_calls, Function, FunctionCall, FunctionCompletion};
pub use model::{LanguageModelContext, TextGenerationModel};
pub use pipeline::{Input, TextGenerationOutput, TextGenerationPipeline};
