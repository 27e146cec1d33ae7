use anyhow::Result;
use gorilla_chat::{pipeline, Message, GORILLA_OPENFUNCTIONS_V2};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let pipe = pipeline("text-generation", GORILLA_OPENFUNCTIONS_V2).await?;

    let messages = vec![Message::user("Who are you?")];
    let output = pipe.generate(&messages).await?;

    println!("{}", output.reply());

    Ok(())
}
