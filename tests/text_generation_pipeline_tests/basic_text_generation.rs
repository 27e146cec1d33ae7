use crate::mock::{MockModel, MockOptions};
use gorilla_chat::models::generation::GenerationParams;
use gorilla_chat::pipelines::text_generation::*;
use gorilla_chat::pipelines::utils::DeviceSelectable;
use gorilla_chat::{Message, PipelineError, Role};

async fn pipeline_for(model: MockModel) -> anyhow::Result<TextGenerationPipeline<MockModel>> {
    TextGenerationPipeline::new(model, GenerationParams::default(), candle_core::Device::Cpu).await
}

#[tokio::test]
async fn basic_text_generation() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("basic"))).await?;
    let out = pipeline.completion("who are you?").await?;
    assert_eq!(out, "i am gorilla");
    Ok(())
}

#[tokio::test]
async fn generate_appends_the_assistant_reply() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("generate"))).await?;
    let messages = vec![Message::user("who are you?")];

    let output = pipeline.generate(&messages).await?;

    assert_eq!(output.generated_text.len(), 2);
    assert_eq!(output.generated_text[0], messages[0]);
    assert_eq!(output.generated_text[1].role(), Role::Assistant);
    assert_eq!(output.reply(), "i am gorilla");

    let json = serde_json::to_value(&output)?;
    assert_eq!(json["generated_text"][1]["role"], "assistant");
    assert_eq!(json["generated_text"][1]["content"], "i am gorilla");
    Ok(())
}

#[tokio::test]
async fn basic_streaming() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("stream"))).await?;
    let mut stream = pipeline.completion_stream("who are you?").await?;
    let mut acc = String::new();
    while let Some(tok) = stream.next().await {
        acc.push_str(&tok?);
    }
    assert_eq!(acc, "i am gorilla");
    Ok(())
}

#[tokio::test]
async fn streaming_matches_completion() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("stream-collect"))).await?;
    let streamed = pipeline.completion_stream("who are you?").await?.collect().await?;
    let completed = pipeline.completion("who are you?").await?;
    assert_eq!(streamed, completed);
    Ok(())
}

#[tokio::test]
async fn stream_take_returns_first_chunks() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("stream-take"))).await?;
    let chunks = pipeline.completion_stream("who are you?").await?.take(2).await?;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks.concat(), "i am");
    Ok(())
}

#[tokio::test]
async fn max_len_cuts_the_reply() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("max-len"))).await?;
    pipeline
        .set_generation_params(GenerationParams {
            max_len: 2,
            ..Default::default()
        })
        .await;
    assert_eq!(pipeline.generation_params().await.max_len, 2);

    assert_eq!(pipeline.completion("who are you?").await?, "i am");
    Ok(())
}

#[tokio::test]
async fn zero_max_len_generates_nothing() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("zero-len"))).await?;
    pipeline
        .set_generation_params(GenerationParams {
            max_len: 0,
            ..Default::default()
        })
        .await;
    assert_eq!(pipeline.completion("who are you?").await?, "");
    Ok(())
}

#[tokio::test]
async fn eos_token_is_not_part_of_the_reply() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("eos"))).await?;
    let out = pipeline.completion("who are you?").await?;
    assert!(!out.contains("<eos>"));
    Ok(())
}

#[tokio::test]
async fn empty_conversation_is_rejected() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockModel::new(MockOptions::new("empty"))).await?;
    let messages: Vec<Message> = Vec::new();

    let err = pipeline.generate(&messages).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::EmptyConversation)
    ));

    let err = pipeline.completion_stream(&messages).await.err().unwrap();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::EmptyConversation)
    ));
    Ok(())
}

#[tokio::test]
async fn prompt_longer_than_context_is_rejected() -> anyhow::Result<()> {
    let pipeline =
        pipeline_for(MockModel::new(MockOptions::new("overflow").max_seq_len(4))).await?;
    let err = pipeline.completion("who are you?").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ContextOverflow { max_seq_len: 4, .. })
    ));
    assert_eq!(pipeline.max_context_length().await, 4);
    Ok(())
}

#[tokio::test]
async fn context_position_counts_fed_tokens() -> anyhow::Result<()> {
    let model = MockModel::new(MockOptions::new("position"));
    let messages = vec![Message::user("who are you?")];
    let prompt_len = model.prompt_len(&messages);
    let pipeline = pipeline_for(model).await?;

    assert_eq!(pipeline.context_position().await, 0);
    pipeline.completion(&messages).await?;
    // The final reply token is fed back; the sampled EOS is not.
    assert_eq!(pipeline.context_position().await, prompt_len + 3);

    pipeline.reset_context().await;
    assert_eq!(pipeline.context_position().await, 0);
    Ok(())
}

#[tokio::test]
async fn follow_up_turn_reuses_the_kv_cache() -> anyhow::Result<()> {
    let model = MockModel::new(MockOptions::new("kv-reuse"));
    let pipeline = pipeline_for(model.clone()).await?;

    let mut messages = vec![Message::user("who are you?")];
    let reply = pipeline.completion(&messages).await?;
    let resets_after_first_turn = model.resets();

    messages.push(Message::assistant(&reply));
    messages.push(Message::user("who are you?"));
    let second = pipeline.completion(&messages).await?;

    assert_eq!(second, "i am gorilla");
    assert_eq!(model.resets(), resets_after_first_turn);
    assert_eq!(pipeline.context_position().await, model.prompt_len(&messages) + 3);
    Ok(())
}

#[tokio::test]
async fn unrelated_conversation_resets_the_context() -> anyhow::Result<()> {
    let model = MockModel::new(MockOptions::new("kv-reset"));
    let pipeline = pipeline_for(model.clone()).await?;

    pipeline.completion("who are you?").await?;
    let resets_after_first_turn = model.resets();

    let messages = vec![Message::system("you are gorilla"), Message::user("who are you?")];
    pipeline.completion(&messages).await?;

    assert_eq!(model.resets(), resets_after_first_turn + 1);
    assert_eq!(pipeline.context_position().await, model.prompt_len(&messages) + 3);
    Ok(())
}

#[tokio::test]
async fn builder_applies_overrides_and_shares_models() -> anyhow::Result<()> {
    let first = TextGenerationPipelineBuilder::<MockModel>::new(MockOptions::new("builder"))
        .cpu()
        .seed(7)
        .max_len(1)
        .build()
        .await?;
    let params = first.generation_params().await;
    assert_eq!(params.seed, 7);
    assert_eq!(params.max_len, 1);
    assert_eq!(params.temperature, 0.0);
    assert_eq!(first.completion("who are you?").await?, "i");

    let second = TextGenerationPipelineBuilder::<MockModel>::new(MockOptions::new("builder"))
        .cpu()
        .build()
        .await?;
    assert_eq!(second.generation_params().await.max_len, 512);
    assert_eq!(second.context_position().await, 0);
    Ok(())
}
