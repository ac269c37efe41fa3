//! Durable persistence for `Article` (spec §4.2). Grounded in a
//! `sqlx::Pool<Postgres>`-backed manager that performed feed/entry CRUD with
//! `ON CONFLICT ... DO NOTHING` upserts and priority-scored queue selection;
//! adapted here to the single `articles` table, its lifecycle fields, and
//! monthly partitioning. Uses dynamic `sqlx::query` rather than the
//! `sqlx::query!` compile-time macros, since the latter require a live
//! database/`.sqlx` cache at build time that this deployment doesn't assume.

use crate::error::{PipelineError, Result};
use crate::models::{Article, ArticleCandidate, BlogHostType, Relevance};
use chrono::{DateTime, Datelike, Utc};
use sqlx::{postgres::PgPoolOptions, Acquire, Pool, Postgres, Row};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub struct ArticleStore {
    db: Pool<Postgres>,
}

impl ArticleStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { db })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await.map_err(|e| {
            PipelineError::Configuration(format!("running migrations: {e}"))
        })
    }

    /// Ensures the partition for `instant`'s month exists (spec §4.2:
    /// "idempotent create-if-missing"). Mirrors the original implementation's
    /// `information_schema.tables` existence check before issuing the
    /// `CREATE TABLE ... PARTITION OF` statement.
    pub async fn ensure_partition(&self, instant: DateTime<Utc>) -> Result<()> {
        let year = instant.year();
        let month = instant.month();
        let partition = format!("articles_y{year}m{month:02}");

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(&partition)
        .fetch_one(&self.db)
        .await?;

        if exists {
            return Ok(());
        }

        let start = format!("{year}-{month:02}-01");
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        let end = format!("{next_year}-{next_month:02}-01");

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {partition} PARTITION OF articles FOR VALUES FROM ('{start}') TO ('{end}')"
        );
        sqlx::query(&ddl).execute(&self.db).await?;
        info!("created partition {partition}");
        Ok(())
    }

    /// `insert_many` (spec §4.2): bulk insert, falling back to per-row
    /// insertion on a uniqueness violation so the rest of the batch still
    /// lands. Returns the number of rows actually inserted.
    ///
    /// `articles` is `PARTITION BY RANGE (published_on)`, so its unique
    /// constraints are composite (`post_id, published_on` and
    /// `url, published_on`) — Postgres requires the `ON CONFLICT` inference
    /// target to match one of them exactly. Only the `post_id` constraint is
    /// given as an inference target; a `url` collision still raises a
    /// database error, which would otherwise abort the whole transaction
    /// (`25P02`). Each row therefore runs inside its own `SAVEPOINT`
    /// (`tx.begin()` on an open transaction), so a single duplicate rolls
    /// back only that row and leaves the rest of the batch intact.
    pub async fn insert_many(&self, candidates: &[ArticleCandidate]) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }

        for candidate in candidates {
            self.ensure_partition(candidate.published_on).await?;
        }

        let mut tx = self.db.begin().await?;
        let mut inserted = 0usize;

        for candidate in candidates {
            let now = Utc::now();
            let mut savepoint = tx.begin().await?;
            let result = sqlx::query(
                r#"
                INSERT INTO articles
                    (post_id, url, title, content, html_content, blog_host, blog_host_type,
                     published_on, published_on_is_fallback, simhash, relevance, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'unknown', $11, $11)
                ON CONFLICT (post_id, published_on) DO NOTHING
                "#,
            )
            .bind(&candidate.post_id)
            .bind(&candidate.url)
            .bind(&candidate.title)
            .bind(&candidate.content)
            .bind(&candidate.html_content)
            .bind(&candidate.blog_host)
            .bind(candidate.blog_host_type.to_string())
            .bind(candidate.published_on)
            .bind(candidate.published_on_is_fallback)
            .bind(&candidate.simhash)
            .bind(now)
            .execute(&mut *savepoint)
            .await;

            match result {
                Ok(res) => {
                    savepoint.commit().await?;
                    inserted += res.rows_affected() as usize;
                }
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    savepoint.rollback().await?;
                    debug!("skipping duplicate article url={}", candidate.url);
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// `existing_urls` (spec §4.2).
    pub async fn existing_urls(&self) -> Result<std::collections::HashSet<String>> {
        let rows = sqlx::query("SELECT url FROM articles")
            .fetch_all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("url"))
            .collect::<std::result::Result<_, _>>()?)
    }

    /// `select_unchecked` (spec §4.2): `relevance IS unknown`, newest-first.
    pub async fn select_unchecked(&self, limit: Option<i64>) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            "SELECT * FROM articles WHERE relevance = 'unknown' ORDER BY published_on DESC LIMIT $1",
        )
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(row_to_article).collect()
    }

    /// `select_relevant_unclassified` (spec §4.2).
    pub async fn select_relevant_unclassified(&self, limit: Option<i64>) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM articles
            WHERE relevance = 'true' AND relevance_score >= 0.7 AND category IS NULL
            ORDER BY published_on DESC
            LIMIT $1
            "#,
        )
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(row_to_article).collect()
    }

    /// `select_by_window` (spec §4.2).
    pub async fn select_by_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        only_relevant: bool,
        only_classified: bool,
        limit: Option<i64>,
    ) -> Result<Vec<Article>> {
        let mut query = String::from("SELECT * FROM articles WHERE published_on >= $1 AND published_on <= $2");
        if only_relevant {
            query.push_str(" AND relevance = 'true'");
        }
        if only_classified {
            query.push_str(" AND category IS NOT NULL");
        }
        query.push_str(" ORDER BY published_on DESC LIMIT $3");

        let rows = sqlx::query(&query)
            .bind(from)
            .bind(to)
            .bind(limit.unwrap_or(i64::MAX))
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(row_to_article).collect()
    }

    /// `update_relevance_batch` (spec §4.2). Each row update is its own
    /// statement inside one transaction, giving at-least-once/idempotent
    /// semantics: re-running with the same map sets the same values again.
    pub async fn update_relevance_batch(&self, updates: &HashMap<String, (bool, f64)>) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let mut updated = 0usize;
        for (post_id, (relevant, score)) in updates {
            let relevance = if *relevant { "true" } else { "false" };
            let result = sqlx::query(
                "UPDATE articles SET relevance = $1, relevance_score = $2, updated_at = $3 WHERE post_id = $4",
            )
            .bind(relevance)
            .bind(score)
            .bind(Utc::now())
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// `update_classification_batch` (spec §4.2). Enforces I3 at the write
    /// site: classifying an article that isn't strongly relevant is a
    /// programming bug, not a data problem, so it fails loudly (spec §9).
    pub async fn update_classification_batch(
        &self,
        updates: &HashMap<String, (String, Option<String>, f64)>,
    ) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let mut updated = 0usize;
        for (post_id, (category, subcategory, confidence)) in updates {
            let guard: Option<(String, Option<f64>)> =
                sqlx::query_as("SELECT relevance, relevance_score FROM articles WHERE post_id = $1")
                    .bind(post_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            match guard {
                Some((relevance, score)) if relevance == "true" && score.unwrap_or(0.0) >= 0.7 => {}
                Some(_) => {
                    return Err(PipelineError::InvariantViolation(format!(
                        "attempted classification of non-relevant article {post_id}"
                    )))
                }
                None => continue,
            }

            let result = sqlx::query(
                "UPDATE articles SET category = $1, subcategory = $2, classification_confidence = $3, updated_at = $4 WHERE post_id = $5",
            )
            .bind(category)
            .bind(subcategory)
            .bind(confidence)
            .bind(Utc::now())
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// `update_summaries` (spec §4.2).
    pub async fn update_summaries(&self, summaries: &[(String, String)]) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let mut updated = 0usize;
        for (post_id, summary) in summaries {
            let result = sqlx::query("UPDATE articles SET summary = $1, updated_at = $2 WHERE post_id = $3")
                .bind(summary)
                .bind(Utc::now())
                .bind(post_id)
                .execute(&mut *tx)
                .await?;
            updated += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Category breakdown for the monthly stats report (SPEC_FULL §B "Feed
    /// health reporting"); mirrors the month-keyed category aggregation the
    /// stats collector performed over the articles table.
    pub async fn category_stats(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT category, COUNT(*) as c FROM articles WHERE category IS NOT NULL GROUP BY category")
            .fetch_all(&self.db)
            .await?;
        let mut stats = HashMap::new();
        for row in rows {
            let category: String = row.try_get("category")?;
            let count: i64 = row.try_get("c")?;
            stats.insert(category, count);
        }
        Ok(stats)
    }

    /// `delete_irrelevant` (spec §3: "administrative purge... offered as an
    /// idempotent operation").
    pub async fn delete_irrelevant(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM articles WHERE relevance = 'false'")
            .execute(&self.db)
            .await?;
        let removed = result.rows_affected() as usize;
        if removed > 0 {
            warn!("purged {removed} irrelevant articles");
        }
        Ok(removed)
    }
}

fn row_to_article(row: sqlx::postgres::PgRow) -> Result<Article> {
    let blog_host_type_str: String = row.try_get("blog_host_type")?;
    let relevance_str: String = row.try_get("relevance")?;

    Ok(Article {
        id: row.try_get("id")?,
        post_id: row.try_get("post_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        html_content: row.try_get("html_content")?,
        blog_host: row.try_get("blog_host")?,
        blog_host_type: BlogHostType::from_str(&blog_host_type_str)
            .map_err(PipelineError::Parse)?,
        published_on: row.try_get("published_on")?,
        published_on_is_fallback: row.try_get("published_on_is_fallback")?,
        simhash: row.try_get("simhash")?,
        relevance: match relevance_str.as_str() {
            "true" => Relevance::True,
            "false" => Relevance::False,
            _ => Relevance::Unknown,
        },
        relevance_score: row.try_get("relevance_score")?,
        category: row.try_get("category")?,
        subcategory: row.try_get("subcategory")?,
        classification_confidence: row.try_get("classification_confidence")?,
        summary: row.try_get("summary")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
