use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use screentext::config::CloudOcrConfig;
use screentext::engine::{
    CloudVisionClient, OcrAdapterStatus, OcrEngineAdapter, RecognitionRequest,
};
use screentext::error::OcrError;

fn cloud_config(model: &str, base_url: String, max_retries: u32) -> CloudOcrConfig {
    CloudOcrConfig {
        model: model.to_string(),
        api_key: Some("test-key".to_string()),
        base_url: Some(base_url),
        timeout_secs: 5,
        max_retries,
        languages: vec!["en".to_string(), "ja".to_string()],
    }
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [
            {
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }
        ]
    })
}

#[tokio::test]
async fn test_recognize_sends_image_and_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(|request: &Request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            assert_eq!(body["model"], "pixtral-12b-2409");
            let parts = &body["messages"][0]["content"];
            assert_eq!(parts[0]["type"], "text");
            assert!(parts[0]["text"].as_str().unwrap().contains("'ja'"));
            assert!(parts[1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,"));
            ResponseTemplate::new(200).set_body_json(completion_body("  吹き出し  \n"))
        })
        .expect(1)
        .mount(&server)
        .await;

    let config = cloud_config("mistral/pixtral-12b-2409", format!("{}/v1", server.uri()), 1);
    let client = CloudVisionClient::new(&config).unwrap();

    let text = client.recognize(b"\x89PNG fake", "ja").await.unwrap();
    assert_eq!(text, "吹き出し");
}

#[tokio::test]
async fn test_retry_on_server_error() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_mock = Arc::clone(&attempts);

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |_request: &Request| {
            if attempts_for_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(500).set_body_string("upstream temporary failure")
            } else {
                ResponseTemplate::new(200).set_body_json(completion_body("Recovered"))
            }
        })
        .mount(&server)
        .await;

    let config = cloud_config("openai/gpt-4o", format!("{}/v1", server.uri()), 2);
    let client = CloudVisionClient::new(&config).unwrap();

    let text = client.recognize(b"img", "en").await.unwrap();
    assert_eq!(text, "Recovered");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(2)
        .mount(&server)
        .await;

    let config = cloud_config("deepseek/deepseek-vl", format!("{}/v1", server.uri()), 2);
    let client = CloudVisionClient::new(&config).unwrap();

    let result = client.recognize(b"img", "en").await;
    assert!(matches!(result, Err(OcrError::Engine(_))));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let config = cloud_config("openai/gpt-4o", format!("{}/v1", server.uri()), 3);
    let client = CloudVisionClient::new(&config).unwrap();

    match client.recognize(b"img", "en").await {
        Err(OcrError::Engine(message)) => assert!(message.contains("bad key")),
        other => panic!("Expected engine error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_cloud_adapter_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Hello")))
        .mount(&server)
        .await;

    let config = cloud_config("openai/gpt-4o", format!("{}/v1", server.uri()), 1);
    let client = CloudVisionClient::new(&config).unwrap();
    let adapter = OcrEngineAdapter::cloud("openai", client, config.languages.clone());

    adapter.initialize(None).await.unwrap();
    assert_eq!(adapter.status(), OcrAdapterStatus::Enabled);
    assert_eq!(adapter.get_supported_languages().await, vec!["en", "ja"]);

    let result = adapter
        .recognize(RecognitionRequest::new(b"img".to_vec(), "en"))
        .await
        .unwrap();
    assert_eq!(result.text(), "Hello");
}
