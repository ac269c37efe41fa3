//! The LLM Orchestrator (spec §4.4): a shared OpenAI-compatible chat client
//! plus four stages (relevance, classification, summarization, strict
//! re-check). Grounded in a retry-with-exponential-backoff Claude API client
//! seen elsewhere in the pack (special-cased longer backoff on 429), adapted
//! to spec's plain `2^k` backoff and markdown-fence-stripped JSON contracts.

use crate::config::LlmConfig;
use crate::models::Taxonomy;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Tagged-union error for the LLM client (spec §9 "Tagged-union error
/// handling"). Only `Transient` triggers retry at the call site.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("parse failure: {0}")]
    ParseFailure(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Stateless wrapper around the chat-completion endpoint; its semaphores are
/// the only shared coordination primitive (spec §5).
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
    relevance_semaphore: Arc<Semaphore>,
    classification_semaphore: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, relevance_concurrency: usize, classification_concurrency: usize) -> Self {
        Self {
            http: Client::builder()
                .timeout(config.request_timeout)
                .build()
                .expect("building the LLM HTTP client"),
            config,
            relevance_semaphore: Arc::new(Semaphore::new(relevance_concurrency)),
            classification_semaphore: Arc::new(Semaphore::new(classification_concurrency)),
        }
    }

    /// POST `/chat/completions` with retry: exponential backoff `2^k`
    /// seconds on HTTP {500,502,503,504} and timeouts, up to `max_retries`
    /// (spec §4.4 "Shared client").
    async fn complete(&self, model: &str, prompt: String, temperature: f32) -> LlmResult<String> {
        let mut attempt = 0u32;
        loop {
            let request = ChatRequest {
                model,
                messages: vec![ChatMessage { role: "user", content: prompt.clone() }],
                temperature,
                max_tokens: 2048,
            };

            let response = self
                .http
                .post(format!("{}/chat/completions", self.config.base_url))
                .json(&request)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: ChatResponse = resp
                        .json()
                        .await
                        .map_err(|e| LlmError::ParseFailure(e.to_string()))?;
                    return body
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| LlmError::ParseFailure("empty choices array".to_string()));
                }
                Ok(resp) if is_retryable_status(resp.status()) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(LlmError::Transient(format!(
                            "exhausted retries after HTTP {}",
                            resp.status()
                        )));
                    }
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Ok(resp) => {
                    return Err(LlmError::Transient(format!("non-retryable HTTP {}", resp.status())));
                }
                Err(e) if e.is_timeout() => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(LlmError::Transient("exhausted retries after repeated timeouts".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Err(e) => return Err(LlmError::Transient(e.to_string())),
            }
        }
    }

    /// Strips markdown fences and parses JSON (spec §4.4 "Response
    /// extraction").
    fn extract_json(raw: &str) -> LlmResult<Value> {
        let trimmed = raw.trim();
        let unfenced = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .unwrap_or(trimmed)
            .trim();
        let unfenced = unfenced.strip_suffix("```").unwrap_or(unfenced).trim();
        serde_json::from_str(unfenced).map_err(|e| LlmError::ParseFailure(e.to_string()))
    }

    /// Stage A — relevance check. Content under 50 chars never reaches the
    /// LLM (spec §8 boundary behavior). A transient failure (the service is
    /// unreachable) is propagated rather than turned into a sentinel, so
    /// the caller can leave the article's relevance untouched (spec §7 E4:
    /// "rows remain unknown; next cycle processes them") instead of
    /// recording a false negative.
    pub async fn relevance_check(&self, title: &str, content: &str) -> LlmResult<(bool, f64)> {
        if content.len() < 50 {
            return Ok((false, 0.0));
        }
        let _permit = self.relevance_semaphore.acquire().await.expect("semaphore closed");
        let truncated = truncate_chars(content, 100_000);
        let prompt = relevance_prompt(title, &truncated);

        let raw = self
            .complete(&self.config.relevance_model, prompt, self.config.relevance_temperature)
            .await?;

        match Self::extract_json(&raw) {
            Ok(json) => {
                let relevant = json.get("relevant").and_then(Value::as_bool).unwrap_or(false);
                let score = json
                    .get("score")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                Ok((relevant, score))
            }
            Err(e) => {
                warn!("relevance response parse failure: {e}");
                Ok((false, 0.0))
            }
        }
    }

    /// Stage B — classification, validated against the taxonomy. Same
    /// transient/parse-failure split as `relevance_check`.
    pub async fn classify(
        &self,
        title: &str,
        content: &str,
        taxonomy: &Taxonomy,
    ) -> LlmResult<(String, Option<String>, f64)> {
        let _permit = self.classification_semaphore.acquire().await.expect("semaphore closed");
        let prompt = classification_prompt(title, content, taxonomy);

        let raw = self
            .complete(
                &self.config.classification_model,
                prompt,
                self.config.classification_temperature,
            )
            .await?;

        let json = match Self::extract_json(&raw) {
            Ok(json) => json,
            Err(e) => {
                warn!("classification response parse failure: {e}");
                return Ok((String::new(), None, 0.0));
            }
        };

        let category = json.get("category").and_then(Value::as_str).unwrap_or("").to_string();
        let subcategory = json.get("subcategory").and_then(Value::as_str).map(str::to_string);
        let confidence = json.get("confidence").and_then(Value::as_f64).unwrap_or(0.0).clamp(0.0, 1.0);

        if !taxonomy.contains_category(&category) {
            return Ok((String::new(), None, 0.0));
        }

        let subcategory = subcategory.filter(|s| taxonomy.contains_subcategory(&category, s));
        Ok((category, subcategory, confidence))
    }

    /// Stage C — summarization, one completion per article.
    pub async fn summarize(&self, post_id: &str, title: &str, content: &str) -> Option<String> {
        let truncated = truncate_chars(content, 5_000);
        let prompt = summarization_prompt(post_id, title, &truncated);

        let raw = self
            .complete(
                &self.config.summarization_model,
                prompt,
                self.config.summarization_temperature,
            )
            .await
            .ok()?;

        let json = Self::extract_json(&raw).ok()?;
        let array = json.as_array()?;
        let item = array.first()?;
        let returned_id = item.get("post_id").and_then(Value::as_str)?;
        if returned_id != post_id {
            warn!("summary post_id mismatch: expected {post_id}, got {returned_id}");
            return None;
        }
        item.get("summary").and_then(Value::as_str).map(str::to_string)
    }

    /// Stage D — strict re-check: same contract as stage A, tightened
    /// prompt, implementation-side `score >= 0.7` gate (spec §4.4).
    pub async fn strict_recheck(&self, title: &str, content: &str) -> bool {
        let _permit = self.relevance_semaphore.acquire().await.expect("semaphore closed");
        let truncated = truncate_chars(content, 100_000);
        let prompt = strict_recheck_prompt(title, &truncated);

        let raw = match self
            .complete(&self.config.relevance_model, prompt, self.config.relevance_temperature)
            .await
        {
            Ok(raw) => raw,
            Err(_) => return false,
        };

        match Self::extract_json(&raw) {
            Ok(json) => {
                let score = json.get("score").and_then(Value::as_f64).unwrap_or(0.0);
                score >= 0.7
            }
            Err(_) => false,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

const TOPIC_INVENTORY: &str = "compliance and KYC/AML requirements, international sanctions regimes, \
    reputational risk to businesses or individuals, and search-engine technology affecting online reputation; \
    excluding general sports, entertainment, and celebrity gossip unrelated to reputation or compliance";

fn relevance_prompt(title: &str, content: &str) -> String {
    format!(
        "You are screening news articles for relevance to: {TOPIC_INVENTORY}.\n\n\
        Title: {title}\nContent: {content}\n\n\
        Respond with exactly this JSON shape and nothing else:\n\
        {{ \"relevant\": bool, \"score\": float, \"reason\": str, \"matched_topics\": [str] }}"
    )
}

fn strict_recheck_prompt(title: &str, content: &str) -> String {
    format!(
        "Apply a strict, second-pass relevance check against: {TOPIC_INVENTORY}. \
        Only score above 0.7 if the article is unambiguously on-topic.\n\n\
        Title: {title}\nContent: {content}\n\n\
        Respond with exactly this JSON shape and nothing else:\n\
        {{ \"relevant\": bool, \"score\": float, \"reason\": str, \"matched_topics\": [str] }}"
    )
}

fn classification_prompt(title: &str, content: &str, taxonomy: &Taxonomy) -> String {
    let mut categories = String::new();
    for (category, subcats) in &taxonomy.categories {
        categories.push_str(&format!("- {category}: {}\n", subcats.join(", ")));
    }
    format!(
        "Classify the article into exactly one of the following categories and, if applicable, \
        one of its listed subcategories. Use only the names given below.\n\n{categories}\n\
        Title: {title}\nContent: {content}\n\n\
        Respond with exactly this JSON shape and nothing else:\n\
        {{ \"category\": str, \"subcategory\": str, \"confidence\": float }}"
    )
}

fn summarization_prompt(post_id: &str, title: &str, content: &str) -> String {
    format!(
        "Summarize the following article in Russian in 2-3 sentences.\n\n\
        post_id: {post_id}\nTitle: {title}\nContent: {content}\n\n\
        Respond with exactly this JSON shape and nothing else, a single-element array:\n\
        [{{ \"post_id\": \"{post_id}\", \"title\": str, \"summary\": str }}]"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_strips_markdown_fence() {
        let raw = "```json\n{\"relevant\": true, \"score\": 0.9}\n```";
        let json = LlmClient::extract_json(raw).unwrap();
        assert_eq!(json["relevant"], true);
    }

    #[test]
    fn extract_json_handles_bare_json() {
        let raw = "{\"category\": \"Политика\"}";
        let json = LlmClient::extract_json(raw).unwrap();
        assert_eq!(json["category"], "Политика");
    }

    #[test]
    fn extract_json_reports_parse_failure_on_garbage() {
        let raw = "not json at all";
        assert!(LlmClient::extract_json(raw).is_err());
    }
}
