//! Chat digest delivery (spec §6 "Delivery service", §7 "Delivery
//! failure"). Treats `parse_mode` as an opaque label and splits
//! over-long messages at the 4096-character limit, archiving every digest to
//! disk regardless of delivery outcome (SPEC_FULL §B "Digest archiving").

use crate::config::DeliveryConfig;
use crate::error::Result;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

const MESSAGE_LIMIT: usize = 4096;
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Serialize)]
struct DeliveryPayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

pub struct DigestItem {
    pub title: String,
    pub body: String,
    pub source_link: String,
}

pub struct DeliveryClient {
    http: Client,
    config: DeliveryConfig,
    archive_dir: String,
}

impl DeliveryClient {
    pub fn new(config: DeliveryConfig, archive_dir: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            config,
            archive_dir: archive_dir.into(),
        }
    }

    /// Delivers a single digest item, splitting per-field when the combined
    /// text exceeds `MESSAGE_LIMIT`, retrying each message up to
    /// `MAX_DELIVERY_ATTEMPTS` times (spec §7).
    pub async fn deliver_digest_item(&self, item: &DigestItem) -> Result<()> {
        let messages = split_for_delivery(item);
        for (idx, message) in messages.iter().enumerate() {
            if idx > 0 {
                tokio::time::sleep(Duration::from_millis(1200)).await;
            }
            self.send_with_retry(message).await;
        }
        Ok(())
    }

    /// A plain informational notice (spec §7: "no relevant publications" /
    /// "service unavailable").
    pub async fn deliver_notice(&self, text: &str) -> Result<()> {
        self.send_with_retry(text).await;
        Ok(())
    }

    async fn send_with_retry(&self, text: &str) {
        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            let payload = DeliveryPayload {
                chat_id: &self.config.chat_id,
                text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            };

            let result = self
                .http
                .post(&self.config.base_url)
                .bearer_auth(&self.config.bot_token)
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => warn!("delivery attempt {attempt} failed with status {}", resp.status()),
                Err(e) => warn!("delivery attempt {attempt} failed: {e}"),
            }

            if attempt < MAX_DELIVERY_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
        error!("delivery exhausted all retries; message recorded in archive only");
    }

    /// Writes the day's digest to `logs/digests/YYYY-MM-DD.txt`, independent
    /// of delivery success, so a delivery failure still leaves a record
    /// (spec §6, §7).
    pub fn archive_digest(&self, items: &[DigestItem]) -> Result<()> {
        std::fs::create_dir_all(&self.archive_dir)?;
        let filename = format!("{}.txt", Utc::now().format("%Y-%m-%d"));
        let path = Path::new(&self.archive_dir).join(filename);

        let mut buf = String::new();
        for item in items {
            buf.push_str(&format!("# {}\n\n{}\n\nSource: {}\n\n---\n\n", item.title, item.body, item.source_link));
        }

        std::fs::write(path, buf)?;
        info!("archived {} digest items", items.len());
        Ok(())
    }
}

/// Splits a digest item into delivery-sized messages. Per spec §6: "split
/// per-field (title, body, source link)".
fn split_for_delivery(item: &DigestItem) -> Vec<String> {
    let whole = format!("{}\n\n{}\n\n{}", item.title, item.body, item.source_link);
    if whole.chars().count() <= MESSAGE_LIMIT {
        return vec![whole];
    }

    let mut messages = Vec::new();
    for field in [&item.title, &item.body, &item.source_link] {
        for chunk in chunk_by_chars(field, MESSAGE_LIMIT) {
            messages.push(chunk);
        }
    }
    messages
}

fn chunk_by_chars(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_item_is_not_split() {
        let item = DigestItem {
            title: "Short title".into(),
            body: "Short body.".into(),
            source_link: "https://example.com".into(),
        };
        assert_eq!(split_for_delivery(&item).len(), 1);
    }

    #[test]
    fn oversized_item_splits_per_field() {
        let item = DigestItem {
            title: "T".repeat(10),
            body: "B".repeat(5000),
            source_link: "https://example.com".into(),
        };
        let messages = split_for_delivery(&item);
        assert!(messages.len() > 1);
        assert!(messages.iter().all(|m| m.chars().count() <= MESSAGE_LIMIT));
    }
}
