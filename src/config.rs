use crate::error::{PipelineError, Result};
use crate::models::{FeedSourceFile, Taxonomy};
use std::path::Path;
use std::time::Duration;

/// Process-wide configuration, assembled from environment variables (spec
/// §6 "Environment variables"). Loaded once in `main` and threaded through
/// explicitly rather than read from `std::env` deep inside the pipeline —
/// the global-singleton pattern the source used for its DB/LLM clients is
/// exactly what spec §9 asks to replace with explicit context.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub llm: LlmConfig,
    pub delivery: DeliveryConfig,
    pub concurrency: ConcurrencyConfig,
    pub run_on_startup: bool,
    pub sources_path: String,
    pub taxonomy_path: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub relevance_model: String,
    pub classification_model: String,
    pub summarization_model: String,
    pub relevance_temperature: f32,
    pub classification_temperature: f32,
    pub summarization_temperature: f32,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub base_url: String,
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub fetch: usize,
    pub relevance: usize,
    pub classification: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            fetch: 10,
            relevance: 3,
            classification: 2,
        }
    }
}

impl Config {
    /// Loads `.env` (if present) then reads the environment, matching the
    /// `dotenvy` + `std::env` pattern used for ambient configuration across
    /// the example pack. Missing required variables are a fatal
    /// `Configuration` error (spec §7).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = require_env("DATABASE_URL")?;

        let llm = LlmConfig {
            base_url: require_env("LLM_BASE_URL")?,
            relevance_model: env_or("LLM_RELEVANCE_MODEL", "gpt-4o-mini"),
            classification_model: env_or("LLM_CLASSIFICATION_MODEL", "gpt-4o-mini"),
            summarization_model: env_or("LLM_SUMMARIZATION_MODEL", "gpt-4o-mini"),
            relevance_temperature: env_parse_or("LLM_RELEVANCE_TEMPERATURE", 0.1)?,
            classification_temperature: env_parse_or("LLM_CLASSIFICATION_TEMPERATURE", 0.1)?,
            summarization_temperature: env_parse_or("LLM_SUMMARIZATION_TEMPERATURE", 0.3)?,
            request_timeout: Duration::from_secs(env_parse_or("LLM_REQUEST_TIMEOUT_SECS", 360)?),
            max_retries: env_parse_or("LLM_MAX_RETRIES", 5)?,
        };

        let delivery = DeliveryConfig {
            base_url: require_env("DELIVERY_BASE_URL")?,
            bot_token: require_env("DELIVERY_BOT_TOKEN")?,
            chat_id: require_env("DELIVERY_CHAT_ID")?,
        };

        let concurrency = ConcurrencyConfig {
            fetch: env_parse_or("FETCH_CONCURRENCY", 10)?,
            relevance: env_parse_or("RELEVANCE_CONCURRENCY", 3)?,
            classification: env_parse_or("CLASSIFICATION_CONCURRENCY", 2)?,
        };

        let run_on_startup = env_or("RUN_ON_STARTUP", "false")
            .eq_ignore_ascii_case("true");

        let sources_path = env_or("FEED_SOURCES_PATH", "config/sources.json");
        let taxonomy_path = env_or("TAXONOMY_PATH", "config/taxonomy.json");

        Ok(Self {
            database_url,
            llm,
            delivery,
            concurrency,
            run_on_startup,
            sources_path,
            taxonomy_path,
        })
    }

    /// Redacted form suitable for logging (spec's ambient logging concern —
    /// credentials never reach a log line verbatim).
    pub fn redacted_database_url(&self) -> String {
        redact_credentials(&self.database_url)
    }
}

fn redact_credentials(dsn: &str) -> String {
    match url::Url::parse(dsn) {
        Ok(mut u) => {
            let _ = u.set_password(Some("***"));
            u.to_string()
        }
        Err(_) => "<unparseable DSN>".to_string(),
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| PipelineError::Configuration(format!("missing required environment variable {key}")))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| PipelineError::Configuration(format!("invalid value for {key}: {v}"))),
        Err(_) => Ok(default),
    }
}

/// Loads the feed source list from a JSON or YAML file, selected by
/// extension (spec §6: "JSON (preferred) or YAML").
pub fn load_feed_sources(path: &str) -> Result<FeedSourceFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Configuration(format!("reading {path}: {e}")))?;
    if Path::new(path).extension().and_then(|e| e.to_str()) == Some("json") {
        Ok(serde_json::from_str(&raw)?)
    } else {
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// Loads the taxonomy (category → subcategory list) from a JSON file.
pub fn load_taxonomy(path: &str) -> Result<Taxonomy> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Configuration(format!("reading {path}: {e}")))?;
    Ok(serde_json::from_str(&raw)?)
}
