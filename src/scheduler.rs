//! Pipeline Scheduler (spec §4.5): owns time-based dispatch and composes the
//! other components. Grounded in the teacher's `tokio::select!`-driven
//! interval loop, replaced here with `tokio-cron-scheduler` cron jobs plus
//! the explicit `hourly_job`/`daily_job` compositions spec's control-flow
//! section names. No global singletons: every job closure captures an
//! explicit `Arc<PipelineContext>` (spec §9 "Global singletons").

use crate::config::Config;
use crate::delivery::{DeliveryClient, DigestItem};
use crate::dedup::{self, DedupItem};
use crate::fetcher::Fetcher;
use crate::llm::LlmClient;
use crate::models::{FeedSource, Taxonomy};
use crate::store::ArticleStore;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Europe::Moscow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub struct PipelineContext {
    pub config: Config,
    pub sources: Vec<FeedSource>,
    pub taxonomy: Taxonomy,
    pub fetcher: Fetcher,
    pub store: ArticleStore,
    pub llm: LlmClient,
    pub delivery: DeliveryClient,
}

impl PipelineContext {
    pub async fn bootstrap(config: Config, sources: Vec<FeedSource>, taxonomy: Taxonomy) -> crate::error::Result<Self> {
        let store = ArticleStore::connect(&config.database_url).await?;
        store.migrate().await?;

        let fetcher = Fetcher::new(config.concurrency.fetch);
        let llm = LlmClient::new(
            config.llm.clone(),
            config.concurrency.relevance,
            config.concurrency.classification,
        );
        let delivery = DeliveryClient::new(config.delivery.clone(), "logs/digests");

        Ok(Self {
            config,
            sources,
            taxonomy,
            fetcher,
            store,
            llm,
            delivery,
        })
    }
}

/// `hourly_job` (spec §4.5): fetch -> store new -> relevance -> classify.
pub async fn hourly_job(ctx: &PipelineContext) -> crate::error::Result<()> {
    let now_msk = Utc::now().with_timezone(&Moscow);
    let window_to = now_msk.with_timezone(&Utc) - ChronoDuration::minutes(1);
    let window_from = window_to - ChronoDuration::hours(24);

    info!("hourly_job: fetching window [{window_from}, {window_to}]");
    let candidates = ctx.fetcher.fetch_all(&ctx.sources, (window_from, window_to)).await;

    let existing = ctx.store.existing_urls().await?;
    let new_candidates: Vec<_> = candidates.into_iter().filter(|c| !existing.contains(&c.url)).collect();

    let inserted = ctx.store.insert_many(&new_candidates).await?;
    info!("hourly_job: inserted {inserted} new articles");

    run_relevance_stage(ctx, None).await?;
    run_classification_stage(ctx, None).await?;

    if let Err(e) = crate::stats::write_operational_reports(&ctx.fetcher, &ctx.store).await {
        warn!("failed to write operational reports: {e}");
    }

    Ok(())
}

/// `Orchestrator.stage_A over Store.select_unchecked() -> Store.update_relevance_batch`.
/// Commits each batch as it completes; a transient failure (the LLM service
/// is unreachable) aborts the remaining batches without touching their
/// relevance, so those rows stay `unknown` for the next cycle (spec §8 E4).
pub async fn run_relevance_stage(ctx: &PipelineContext, limit: Option<i64>) -> crate::error::Result<usize> {
    let unchecked = ctx.store.select_unchecked(limit).await?;
    if unchecked.is_empty() {
        return Ok(0);
    }

    let mut total_updated = 0usize;
    for batch in unchecked.chunks(10) {
        let results = futures::future::join_all(
            batch.iter().map(|a| ctx.llm.relevance_check(&a.title, &a.content)),
        )
        .await;

        let mut updates = HashMap::new();
        for (article, result) in batch.iter().zip(results) {
            match result {
                Ok((relevant, score)) => {
                    updates.insert(article.post_id.clone(), (relevant, score));
                }
                Err(e) if matches!(e, crate::llm::LlmError::Transient(_)) => {
                    warn!("relevance stage: LLM service unreachable, stopping cycle: {e}");
                    ctx.store.update_relevance_batch(&updates).await?;
                    return Err(crate::error::PipelineError::Transient(e.to_string()));
                }
                Err(e) => warn!("relevance check failed for {}: {e}", article.post_id),
            }
        }

        total_updated += ctx.store.update_relevance_batch(&updates).await?;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    info!("relevance stage: updated {total_updated} articles");
    Ok(total_updated)
}

/// `Orchestrator.stage_B over Store.select_relevant_unclassified() -> Store.update_classification_batch`.
/// Same per-batch commit / transient-abort behavior as `run_relevance_stage`.
pub async fn run_classification_stage(ctx: &PipelineContext, limit: Option<i64>) -> crate::error::Result<usize> {
    let candidates = ctx.store.select_relevant_unclassified(limit).await?;
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut total_updated = 0usize;
    for batch in candidates.chunks(5) {
        let results = futures::future::join_all(
            batch.iter().map(|a| ctx.llm.classify(&a.title, &a.content, &ctx.taxonomy)),
        )
        .await;

        let mut updates = HashMap::new();
        for (article, result) in batch.iter().zip(results) {
            match result {
                Ok((category, subcategory, confidence)) if !category.is_empty() => {
                    updates.insert(article.post_id.clone(), (category, subcategory, confidence));
                }
                Ok(_) => {}
                Err(e) if matches!(e, crate::llm::LlmError::Transient(_)) => {
                    warn!("classification stage: LLM service unreachable, stopping cycle: {e}");
                    ctx.store.update_classification_batch(&updates).await?;
                    return Err(crate::error::PipelineError::Transient(e.to_string()));
                }
                Err(e) => warn!("classification failed for {}: {e}", article.post_id),
            }
        }

        total_updated += ctx.store.update_classification_batch(&updates).await?;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    info!("classification stage: updated {total_updated} articles");
    Ok(total_updated)
}

/// `daily_job` (spec §4.5): select candidates -> dedup -> strict-recheck ->
/// diversify -> summarize -> deliver.
pub async fn daily_job(ctx: &PipelineContext) -> crate::error::Result<()> {
    let (from, to) = daily_window();
    info!("daily_job: window [{from}, {to}]");

    let candidates = ctx
        .store
        .select_by_window(from, to, true, false, None)
        .await?
        .into_iter()
        .filter(|a| a.relevance_score.unwrap_or(0.0) >= 0.7)
        .collect::<Vec<_>>();

    let dedup_items: Vec<DedupItem> = candidates
        .iter()
        .map(|a| DedupItem {
            post_id: a.post_id.clone(),
            title: a.title.clone(),
            content: a.content.clone(),
            simhash: a.simhash.as_deref().and_then(|h| u64::from_str_radix(h, 16).ok()),
            relevance_score: a.relevance_score.unwrap_or(0.0),
        })
        .collect();

    let uniq = dedup::process_posts(&dedup_items);
    let by_post_id: HashMap<_, _> = candidates.iter().map(|a| (a.post_id.clone(), a)).collect();

    let mut strong = Vec::new();
    for item in &uniq {
        let article = match by_post_id.get(&item.post_id) {
            Some(a) => a,
            None => continue,
        };
        if ctx.llm.strict_recheck(&article.title, &article.content).await {
            strong.push(item.clone());
        }
    }

    let top = dedup::select_top_n(&strong, 7);

    if top.is_empty() {
        warn!("daily_job: no survivors after strict re-check");
        ctx.delivery.deliver_notice("No relevant publications were found today.").await?;
        return Ok(());
    }

    let mut summary_items: Vec<DedupItem> = Vec::new();
    let mut digest_by_post_id: HashMap<String, DigestItem> = HashMap::new();
    for item in &top {
        let article = match by_post_id.get(&item.post_id) {
            Some(a) => a,
            None => continue,
        };
        if let Some(summary) = ctx.llm.summarize(&item.post_id, &article.title, &article.content).await {
            summary_items.push(DedupItem {
                post_id: item.post_id.clone(),
                title: article.title.clone(),
                content: summary.clone(),
                simhash: None,
                relevance_score: article.relevance_score.unwrap_or(0.0),
            });
            digest_by_post_id.insert(
                item.post_id.clone(),
                DigestItem {
                    title: article.title.clone(),
                    body: summary,
                    source_link: article.url.clone(),
                },
            );
        }
    }

    // Final dedup over the generated summaries (spec §4.5 step 8): two
    // summaries worded differently can still describe the same story, so
    // this runs after summarization rather than relying on the
    // pre-summary `process_posts`/`select_top_n` passes alone.
    let deduped = dedup::deduplicate_summaries(&summary_items);

    let mut summaries = Vec::new();
    let mut digest_items = Vec::new();
    for item in &deduped {
        if let Some(digest) = digest_by_post_id.remove(&item.post_id) {
            summaries.push((item.post_id.clone(), item.content.clone()));
            digest_items.push(digest);
        }
    }

    ctx.delivery.archive_digest(&digest_items)?;
    for item in &digest_items {
        if let Err(e) = ctx.delivery.deliver_digest_item(item).await {
            error!("failed to deliver digest item: {e}");
        }
    }

    ctx.store.update_summaries(&summaries).await?;
    info!("daily_job: delivered {} summaries", digest_items.len());

    Ok(())
}

/// Window = `[yesterday 09:01 MSK, today 09:00 MSK]` (spec §4.5; spec §9
/// resolves the "09:00 vs preceding-08:00-boundary" ambiguity in favor of
/// the 09:00 definition, matching the scheduled trigger).
fn daily_window() -> (DateTime<Utc>, DateTime<Utc>) {
    let now_msk = Utc::now().with_timezone(&Moscow);
    let today_9am = Moscow
        .with_ymd_and_hms(now_msk.year(), now_msk.month(), now_msk.day(), 9, 0, 0)
        .single()
        .expect("valid MSK 09:00 instant");
    let yesterday_901am = today_9am - ChronoDuration::hours(24) + ChronoDuration::minutes(1);
    (yesterday_901am.with_timezone(&Utc), today_9am.with_timezone(&Utc))
}

/// Starts the long-running scheduler daemon: hourly job at the top of each
/// hour, daily job at 09:00 MSK, with an optional boot-time hourly run
/// (spec §4.5 "Timers").
pub async fn run_scheduler(ctx: Arc<PipelineContext>) -> crate::error::Result<()> {
    if ctx.config.run_on_startup {
        info!("RUN_ON_STARTUP set: running hourly_job before scheduler starts");
        if let Err(e) = hourly_job(&ctx).await {
            error!("boot-time hourly_job failed: {e}");
        }
    }

    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| crate::error::PipelineError::Configuration(e.to_string()))?;

    let hourly_ctx = ctx.clone();
    let hourly = Job::new_async("0 0 * * * *", move |_uuid, _lock| {
        let ctx = hourly_ctx.clone();
        Box::pin(async move {
            if let Err(e) = hourly_job(&ctx).await {
                error!("hourly_job failed: {e}");
            }
        })
    })
    .map_err(|e| crate::error::PipelineError::Configuration(e.to_string()))?;

    let daily_ctx = ctx.clone();
    // 09:00 Moscow time; the cron scheduler runs in the process's local/UTC
    // clock, so this expression is the UTC-equivalent hour (06:00 UTC,
    // MSK = UTC+3, no DST).
    let daily = Job::new_async("0 0 6 * * *", move |_uuid, _lock| {
        let ctx = daily_ctx.clone();
        Box::pin(async move {
            if let Err(e) = daily_job(&ctx).await {
                error!("daily_job failed: {e}");
            }
        })
    })
    .map_err(|e| crate::error::PipelineError::Configuration(e.to_string()))?;

    scheduler
        .add(hourly)
        .await
        .map_err(|e| crate::error::PipelineError::Configuration(e.to_string()))?;
    scheduler
        .add(daily)
        .await
        .map_err(|e| crate::error::PipelineError::Configuration(e.to_string()))?;

    scheduler
        .start()
        .await
        .map_err(|e| crate::error::PipelineError::Configuration(e.to_string()))?;

    info!("scheduler started: hourly at :00, daily at 09:00 MSK");

    // Keep the process alive; the scheduler drives jobs on its own tasks.
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_window_spans_23_hours_59_minutes() {
        let (from, to) = daily_window();
        let span = to - from;
        assert_eq!(span, ChronoDuration::hours(24) - ChronoDuration::minutes(1));
        assert!(to > from);
    }
}
