use mockito::Matcher;
use newsposter::llm::remote::RemoteLlmProvider;
use newsposter::llm::summarizer::{summarize_posts, FALLBACK_SUMMARY};
use newsposter::llm::{LlmProvider, LlmRequest};
use newsposter::retry::RetryPolicy;
use std::time::Duration;

const COMPLETION: &str = r#"{
    "model": "gpt-4o",
    "choices": [{
        "message": {
            "role": "assistant",
            "content": "📈 Рынки растут\n\n#финансы"
        },
        "finish_reason": "stop"
    }],
    "usage": {
        "prompt_tokens": 120,
        "completion_tokens": 30,
        "total_tokens": 150
    }
}"#;

#[tokio::test]
async fn test_remote_provider_sends_system_message() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer fake-api-key")
        .match_body(Matcher::PartialJsonString(
            r#"{"model": "gpt-4o", "messages": [{"role": "system", "content": "be brief"}, {"role": "user", "content": "news"}]}"#
                .to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(COMPLETION)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o");

    let request = LlmRequest {
        system: Some("be brief".to_string()),
        prompt: "news".to_string(),
        max_tokens: Some(100),
        temperature: Some(0.7),
        timeout_seconds: Some(10),
    };

    let response = provider.generate(request).await.unwrap();
    assert_eq!(response.content, "📈 Рынки растут\n\n#финансы");
    assert_eq!(response.usage.total_tokens, 150);
    assert_eq!(response.model, "gpt-4o");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_error_handling() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "Rate limit exceeded"}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o");

    let request = LlmRequest {
        prompt: "Test".to_string(),
        ..Default::default()
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("429"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_timeout() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o");

    let request = LlmRequest {
        prompt: "Test".to_string(),
        timeout_seconds: Some(1),
        ..Default::default()
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("timed out"));
}

#[tokio::test]
async fn test_summary_falls_back_after_server_errors() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(500)
        .with_body("upstream down")
        .expect(2)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o");
    let posts = vec!["Нефть дорожает".to_string()];

    let outcome = summarize_posts(
        &provider,
        &posts,
        RetryPolicy::new(2, Duration::ZERO),
        FALLBACK_SUMMARY,
    )
    .await;

    assert!(outcome.fallback);
    assert_eq!(outcome.text, FALLBACK_SUMMARY);
    mock.assert_async().await;
}
