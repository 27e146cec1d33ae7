//! Task pipelines and the `pipeline(task, model)` entry point.

pub mod text_generation;
pub mod utils;

pub use text_generation::*;

use crate::core::PipelineError;
use crate::models::{LlamaModel, ModelSource};
use std::str::FromStr;

/// Tasks a pipeline can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    TextGeneration,
}

impl FromStr for Task {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text-generation" => Ok(Task::TextGeneration),
            other => Err(PipelineError::UnsupportedTask(other.to_string())),
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::TextGeneration => write!(f, "text-generation"),
        }
    }
}

/// Build a pipeline for `task` backed by `model`, with the model's default
/// generation settings and the best available device.
///
/// Both arguments are validated before anything is downloaded.
///
/// ```no_run
/// # async fn run() -> anyhow::Result<()> {
/// use gorilla_chat::{pipeline, Message};
///
/// let pipe = pipeline("text-generation", "gorilla-llm/gorilla-openfunctions-v2").await?;
/// let output = pipe.generate(&[Message::user("Who are you?")]).await?;
/// println!("{}", output.reply());
/// # Ok(())
/// # }
/// ```
pub async fn pipeline(task: &str, model: &str) -> anyhow::Result<TextGenerationPipeline<LlamaModel>> {
    let task: Task = task.parse()?;
    let source: ModelSource = model.parse()?;
    tracing::info!(%task, model = %source, "building pipeline");

    match task {
        Task::TextGeneration => TextGenerationPipelineBuilder::<LlamaModel>::new(source).build().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_generation_task() {
        assert_eq!("text-generation".parse::<Task>().unwrap(), Task::TextGeneration);
        assert_eq!(Task::TextGeneration.to_string(), "text-generation");
    }

    #[test]
    fn rejects_other_tasks() {
        let err = "summarization".parse::<Task>().unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedTask(t) if t == "summarization"));
    }

    #[tokio::test]
    async fn unsupported_task_fails_before_loading() {
        let err = pipeline("fill-mask", "gorilla-llm/gorilla-openfunctions-v2")
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnsupportedTask(_))
        ));
    }

    #[tokio::test]
    async fn unknown_model_fails_before_loading() {
        let err = pipeline("text-generation", "no-such-model").await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnknownModel(_))
        ));
    }
}
