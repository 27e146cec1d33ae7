use crate::mock::{MockModel, MockOptions, CALL_TOKEN};
use gorilla_chat::models::generation::GenerationParams;
use gorilla_chat::pipelines::text_generation::*;
use serde_json::json;

async fn pipeline_for(options: MockOptions) -> anyhow::Result<TextGenerationPipeline<MockModel>> {
    TextGenerationPipeline::new(
        MockModel::new(options),
        GenerationParams::default(),
        candle_core::Device::Cpu,
    )
    .await
}

fn weather() -> Function {
    Function::new("get_weather", "Current weather for a city").with_parameters(json!({
        "type": "object",
        "properties": { "city": { "type": "string" } },
        "required": ["city"]
    }))
}

#[tokio::test]
async fn function_call_reply_is_parsed() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockOptions::new("calls").script(&[CALL_TOKEN])).await?;

    let out = pipeline
        .completion_with_functions("weather in paris?", &[weather()])
        .await?;

    assert_eq!(out.text, CALL_TOKEN);
    assert_eq!(out.calls.len(), 1);
    assert_eq!(out.calls[0].name, "get_weather");
    assert_eq!(out.calls[0].arguments["city"], json!("Paris"));
    Ok(())
}

#[tokio::test]
async fn prose_reply_has_no_calls() -> anyhow::Result<()> {
    let pipeline = pipeline_for(MockOptions::new("prose")).await?;

    let out = pipeline
        .completion_with_functions("who are you?", &[weather()])
        .await?;

    assert_eq!(out.text, "i am gorilla");
    assert!(out.calls.is_empty());
    Ok(())
}

#[test]
fn several_calls_in_one_reply() -> anyhow::Result<()> {
    let calls = parse_function_calls(
        r#"<<function>>get_weather(city="Paris", days=3), convert(1.5, to=['EUR'])"#,
    )?;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].arguments["days"], json!(3));
    assert_eq!(calls[1].arguments["arg0"], json!(1.5));
    assert_eq!(calls[1].arguments["to"], json!(["EUR"]));
    Ok(())
}
