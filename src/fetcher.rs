//! Concurrent feed acquisition with priority grouping, retry, and health
//! accounting (spec §4.1). Grounded in a conditional-GET reqwest client that
//! previously fetched sources one at a time; priority-group/wave dispatch
//! and the `2*2^(k-1)+uniform(0,1)` backoff are new — the source fetched
//! everything in a flat sequential loop with no priority concept at all.

use crate::models::{ArticleCandidate, FeedSource};
use crate::parser::FeedParser;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct SourceHealth {
    pub success_count: u64,
    pub error_count: u64,
    pub last_status: LastStatus,
    pub last_error: Option<String>,
    pub last_entries_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastStatus {
    #[default]
    Ok,
    Error,
}

/// Outcome of fetching one source, independent of whether it produced
/// candidates — used to drive both the health map and the next cycle's
/// retry-count escalation.
pub struct FetchOutcome {
    pub source_name: String,
    pub candidates: Vec<ArticleCandidate>,
    pub error: Option<String>,
}

pub struct Fetcher {
    client: Client,
    parser: FeedParser,
    health: Arc<RwLock<HashMap<String, SourceHealth>>>,
    default_timeout: Duration,
    concurrency: usize,
}

impl Fetcher {
    pub fn new(concurrency: usize) -> Self {
        let client = Client::builder()
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("building the feed HTTP client");

        Self {
            client,
            parser: FeedParser::new(),
            health: Arc::new(RwLock::new(HashMap::new())),
            default_timeout: Duration::from_secs(30),
            concurrency,
        }
    }

    /// Operation `fetch_all` (spec §4.1): group by priority, dispatch in
    /// waves of size `C`, filter candidates to the requested window.
    pub async fn fetch_all(
        &self,
        sources: &[FeedSource],
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Vec<ArticleCandidate> {
        let mut by_priority: Vec<&FeedSource> = sources.iter().collect();
        by_priority.sort_by_key(|s| s.priority.resolve());

        let mut all_candidates = Vec::new();
        let mut group_start = 0;
        while group_start < by_priority.len() {
            let priority = by_priority[group_start].priority.resolve();
            let mut group_end = group_start;
            while group_end < by_priority.len() && by_priority[group_end].priority.resolve() == priority {
                group_end += 1;
            }
            let group = &by_priority[group_start..group_end];
            all_candidates.extend(self.fetch_group_in_waves(group).await);
            group_start = group_end;
        }

        all_candidates
            .into_iter()
            .filter(|c| c.published_on >= window.0 && c.published_on <= window.1)
            .collect()
    }

    async fn fetch_group_in_waves(&self, group: &[&FeedSource]) -> Vec<ArticleCandidate> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        for source in group {
            let source = (*source).clone();
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let parser_owned = FeedParser::new();
            let default_timeout = self.default_timeout;
            let health = self.health.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let retries = Self::retries_for(&health, &source.name).await;
                fetch_one_with_retry(&client, &parser_owned, &source, default_timeout, retries).await
            }));
        }

        let mut candidates = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(outcome) => {
                    self.record_outcome(&outcome).await;
                    candidates.extend(outcome.candidates);
                }
                Err(e) => error!("fetch task panicked: {e}"),
            }
        }
        candidates
    }

    /// Retry escalation: default 1 attempt, escalated to 3 if the previous
    /// cycle's last recorded status was ERROR (spec §4.1).
    async fn retries_for(health: &Arc<RwLock<HashMap<String, SourceHealth>>>, source_name: &str) -> u32 {
        let health = health.read().await;
        match health.get(source_name) {
            Some(h) if h.last_status == LastStatus::Error => 3,
            _ => 1,
        }
    }

    async fn record_outcome(&self, outcome: &FetchOutcome) {
        let mut health = self.health.write().await;
        let entry = health.entry(outcome.source_name.clone()).or_default();
        entry.last_entries_count = outcome.candidates.len();
        match &outcome.error {
            None => {
                entry.success_count += 1;
                entry.last_status = LastStatus::Ok;
                entry.last_error = None;
            }
            Some(err) => {
                entry.error_count += 1;
                entry.last_status = LastStatus::Error;
                entry.last_error = Some(err.clone());
            }
        }
    }

    pub async fn health_snapshot(&self) -> HashMap<String, SourceHealth> {
        self.health.read().await.clone()
    }

    /// Renders the health map as a JSON document for the periodic report
    /// (spec §4.1 "periodic JSON and markdown report").
    pub async fn health_report_json(&self) -> serde_json::Value {
        let health = self.health.read().await;
        let mut map = serde_json::Map::new();
        for (name, h) in health.iter() {
            map.insert(
                name.clone(),
                serde_json::json!({
                    "success_count": h.success_count,
                    "error_count": h.error_count,
                    "last_status": if h.last_status == LastStatus::Ok { "OK" } else { "ERROR" },
                    "last_error": h.last_error,
                    "last_entries_count": h.last_entries_count,
                }),
            );
        }
        serde_json::Value::Object(map)
    }

    pub async fn health_report_markdown(&self) -> String {
        let health = self.health.read().await;
        let mut out = String::from("| Source | Status | Success | Errors | Last Entries | Last Error |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for (name, h) in health.iter() {
            let status = if h.last_status == LastStatus::Ok { "OK" } else { "ERROR" };
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                name,
                status,
                h.success_count,
                h.error_count,
                h.last_entries_count,
                h.last_error.as_deref().unwrap_or("")
            ));
        }
        out
    }
}

/// Delay before attempt `k` (1-indexed): `2*2^(k-1) + uniform(0,1)` seconds
/// (spec §4.1 "Retry policy").
fn backoff_delay(attempt: u32) -> Duration {
    let base = 2.0 * 2f64.powi(attempt as i32 - 1);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base + jitter)
}

async fn fetch_one_with_retry(
    client: &Client,
    parser: &FeedParser,
    source: &FeedSource,
    default_timeout: Duration,
    max_attempts: u32,
) -> FetchOutcome {
    let timeout = source
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    let mut last_error = None;
    for attempt in 1..=max_attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
        match fetch_once(client, parser, source, timeout).await {
            Ok(candidates) => {
                info!("fetched {} entries from {}", candidates.len(), source.name);
                return FetchOutcome {
                    source_name: source.name.clone(),
                    candidates,
                    error: None,
                };
            }
            Err(err) => {
                warn!("attempt {attempt}/{max_attempts} failed for {}: {err}", source.name);
                last_error = Some(err);
            }
        }
    }

    FetchOutcome {
        source_name: source.name.clone(),
        candidates: Vec::new(),
        error: last_error,
    }
}

async fn fetch_once(
    client: &Client,
    parser: &FeedParser,
    source: &FeedSource,
    timeout: Duration,
) -> std::result::Result<Vec<ArticleCandidate>, String> {
    let response = client
        .get(&source.url)
        .timeout(timeout)
        .send()
        .await
        .map_err(classify_reqwest_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("http_{}", status.as_u16()));
    }

    let body = response.bytes().await.map_err(|_| "connection_error".to_string())?;
    parser
        .parse(&source.name, &body)
        .map_err(|e| {
            debug!("parse error for {}: {e}", source.name);
            "parse_error".to_string()
        })
}

fn classify_reqwest_error(e: reqwest::Error) -> String {
    if e.is_timeout() {
        "timeout".to_string()
    } else if e.is_connect() {
        "connection_error".to_string()
    } else if let Some(status) = e.status() {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            format!("http_{}", status.as_u16())
        } else {
            "fetch_failed".to_string()
        }
    } else {
        "fetch_failed".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_falls_within_the_jitter_window() {
        for attempt in 1..=4u32 {
            let base = 2.0 * 2f64.powi(attempt as i32 - 1);
            let delay = backoff_delay(attempt).as_secs_f64();
            assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
            assert!(delay <= base + 1.0, "attempt {attempt}: {delay} > {}", base + 1.0);
        }
    }

    #[test]
    fn backoff_delay_grows_with_attempt_number() {
        let first = backoff_delay(1).as_secs_f64();
        let third = backoff_delay(3).as_secs_f64();
        // attempt 1 base is 2s (+jitter<1s); attempt 3 base is 8s, so even
        // worst-case jitter ordering still leaves a gap.
        assert!(third > first);
    }

    #[tokio::test]
    async fn retries_for_defaults_to_one_for_an_unknown_source() {
        let health = Arc::new(RwLock::new(HashMap::new()));
        assert_eq!(Fetcher::retries_for(&health, "unknown-source").await, 1);
    }

    #[tokio::test]
    async fn retries_for_escalates_after_a_recorded_error() {
        let health = Arc::new(RwLock::new(HashMap::new()));
        health.write().await.insert(
            "flaky".to_string(),
            SourceHealth {
                last_status: LastStatus::Error,
                ..Default::default()
            },
        );
        assert_eq!(Fetcher::retries_for(&health, "flaky").await, 3);
    }
}
