use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Source-declared shape of a publication. `Media` is what the Fetcher
/// stamps on everything it ingests today (spec §4.1 step 6); the other
/// variants exist so the store and taxonomy can describe non-RSS sources
/// without widening the Article schema later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlogHostType {
    Other,
    Blog,
    Microblog,
    Social,
    Forum,
    Media,
    Review,
    Messenger,
}

impl std::fmt::Display for BlogHostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlogHostType::Other => "OTHER",
            BlogHostType::Blog => "BLOG",
            BlogHostType::Microblog => "MICROBLOG",
            BlogHostType::Social => "SOCIAL",
            BlogHostType::Forum => "FORUM",
            BlogHostType::Media => "MEDIA",
            BlogHostType::Review => "REVIEW",
            BlogHostType::Messenger => "MESSENGER",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BlogHostType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "OTHER" => BlogHostType::Other,
            "BLOG" => BlogHostType::Blog,
            "MICROBLOG" => BlogHostType::Microblog,
            "SOCIAL" => BlogHostType::Social,
            "FORUM" => BlogHostType::Forum,
            "MEDIA" => BlogHostType::Media,
            "REVIEW" => BlogHostType::Review,
            "MESSENGER" => BlogHostType::Messenger,
            other => return Err(format!("unknown blog host type: {other}")),
        })
    }
}

/// Three-valued relevance judgment (spec §3). `Unknown` is the only state an
/// article can be created in; the Orchestrator is the only writer that moves
/// it to `True`/`False`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relevance {
    Unknown,
    True,
    False,
}

impl Relevance {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Relevance::Unknown => None,
            Relevance::True => Some(true),
            Relevance::False => Some(false),
        }
    }

    pub fn from_bool(b: bool) -> Self {
        if b {
            Relevance::True
        } else {
            Relevance::False
        }
    }
}

/// The central entity. Field-by-field correspondence with spec §3; lifecycle
/// fields (`relevance`, `category`, `summary`, …) start null/unknown and are
/// only ever filled in by the Orchestrator (I7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub post_id: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub html_content: Option<String>,
    pub blog_host: String,
    pub blog_host_type: BlogHostType,
    pub published_on: DateTime<Utc>,
    /// Set when `published_on` could not be parsed and fell back to ingest
    /// time (spec §9 open question: "fallback to now with a flag").
    pub published_on_is_fallback: bool,
    pub simhash: Option<String>,
    pub relevance: Relevance,
    pub relevance_score: Option<f64>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub classification_confidence: Option<f64>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A freshly-fetched, not-yet-persisted article. Separate type from
/// `Article` because it has no database identity or audit timestamps yet —
/// those are assigned by the store on insert.
#[derive(Debug, Clone)]
pub struct ArticleCandidate {
    pub post_id: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub html_content: Option<String>,
    pub blog_host: String,
    pub blog_host_type: BlogHostType,
    pub published_on: DateTime<Utc>,
    pub published_on_is_fallback: bool,
    pub simhash: Option<String>,
}

/// Feed source configuration entity (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: PriorityValue,
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Unknown fields are preserved rather than rejected (spec §6).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_priority() -> PriorityValue {
    PriorityValue::Named(Priority::Medium)
}

/// Priority accepts either a named tier or a raw integer in the config file;
/// both resolve to the same numeric scale (low integer = higher priority).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriorityValue {
    Named(Priority),
    Numeric(i32),
}

impl PriorityValue {
    pub fn resolve(&self) -> i32 {
        match self {
            PriorityValue::Named(p) => p.resolve(),
            PriorityValue::Numeric(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn resolve(&self) -> i32 {
        match self {
            Priority::High => 1,
            Priority::Medium => 5,
            Priority::Low => 10,
        }
    }
}

/// Top-level shape of the feed source configuration file (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSourceFile {
    pub sources: Vec<FeedSource>,
}

/// Category → ordered subcategory list (spec §3). Loaded once at startup and
/// treated as immutable for the lifetime of a process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Taxonomy {
    pub categories: HashMap<String, Vec<String>>,
}

impl Taxonomy {
    pub fn contains_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    pub fn contains_subcategory(&self, category: &str, subcategory: &str) -> bool {
        self.categories
            .get(category)
            .map(|subs| subs.iter().any(|s| s == subcategory))
            .unwrap_or(false)
    }
}
