//! HTTP language-model provider against a mock REST endpoint.

use httpmock::prelude::*;
use serde_json::json;
use taskweft::gateway::{
    ChatMessage, GenerateOptions, GenerateRequest, HttpLanguageModel, LanguageModel, ProviderError,
};

fn request(model: &str) -> GenerateRequest {
    GenerateRequest {
        history: vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("say hi"),
        ],
        tools: vec![],
        options: GenerateOptions::plain(model),
    }
}

#[tokio::test]
async fn generate_parses_text_and_function_calls() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1beta/models/gemini-2.0-flash:generateContent")
            .header("x-goog-api-key", "test-key");
        then.status(200).json_body(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "hi "},
                        {"text": "there"},
                        {"functionCall": {"name": "lookup", "args": {"q": "x"}}}
                    ]
                }
            }]
        }));
    });

    let provider = HttpLanguageModel::new(&server.base_url(), "test-key");
    let generated = provider
        .generate(&request("gemini-2.0-flash"), None)
        .await
        .unwrap();
    mock.assert();
    assert_eq!(generated.text, "hi there");
    assert_eq!(generated.tool_calls.len(), 1);
    assert_eq!(generated.tool_calls[0].name, "lookup");
    assert_eq!(generated.tool_calls[0].arguments["q"], "x");
}

#[tokio::test]
async fn rate_limits_and_server_errors_classify() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/v1beta/models/throttled:generateContent");
        then.status(429).body("slow down");
    });
    server.mock(|when, then| {
        when.method(POST).path("/v1beta/models/broken:generateContent");
        then.status(503).body("upstream sad");
    });

    let provider = HttpLanguageModel::new(&server.base_url(), "k");
    let err = provider.generate(&request("throttled"), None).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }));
    let err = provider.generate(&request("broken"), None).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
}

#[tokio::test]
async fn malformed_bodies_are_protocol_errors() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1beta/models/weird:generateContent");
        then.status(200).body("not json at all");
    });
    let provider = HttpLanguageModel::new(&server.base_url(), "k");
    let err = provider.generate(&request("weird"), None).await.unwrap_err();
    assert!(matches!(err, ProviderError::Protocol { .. }));
}

#[tokio::test]
async fn embeddings_round_trip_in_order() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1beta/models/text-embedding-004:batchEmbedContents");
        then.status(200).json_body(json!({
            "embeddings": [
                {"values": [1.0, 0.0]},
                {"values": [0.0, 1.0]}
            ]
        }));
    });
    let provider = HttpLanguageModel::new(&server.base_url(), "k");
    let vectors = provider
        .embed("text-embedding-004", &["a".into(), "b".into()])
        .await
        .unwrap();
    mock.assert();
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}
