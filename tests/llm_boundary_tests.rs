use insight_pipeline::config::LlmConfig;
use insight_pipeline::llm::LlmClient;
use std::time::Duration;

fn test_config() -> LlmConfig {
    LlmConfig {
        base_url: "http://127.0.0.1:1".to_string(), // unroutable; must never be hit in this test
        relevance_model: "test-model".to_string(),
        classification_model: "test-model".to_string(),
        summarization_model: "test-model".to_string(),
        relevance_temperature: 0.1,
        classification_temperature: 0.1,
        summarization_temperature: 0.3,
        request_timeout: Duration::from_secs(1),
        max_retries: 1,
    }
}

/// Spec §8 boundary: "Articles with content.length < 50: Stage A returns
/// (false, 0.0) without calling the LLM." The base URL above is
/// unroutable, so if the client called out to it this test would hang or
/// error instead of returning immediately.
#[tokio::test]
async fn short_content_never_reaches_the_llm() {
    let client = LlmClient::new(test_config(), 3, 2);
    let (relevant, score) = client
        .relevance_check("Short", "too short")
        .await
        .expect("short-circuit never calls the LLM, so it never fails");
    assert!(!relevant);
    assert_eq!(score, 0.0);
}
