//! Operational reporting (SPEC_FULL §B "Feed health reporting"): the
//! `logs/` directory receives a rotating feed-health CSV, a monthly stats
//! JSON keyed by category, and a markdown health report (spec §6
//! "Persisted state layout"). Grounded in the original implementation's
//! month-keyed stats aggregation, re-expressed as an explicit function over
//! explicit context rather than a global collector object (spec §9).

use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::store::ArticleStore;
use chrono::Utc;
use std::path::Path;

const LOG_DIR: &str = "logs";

pub async fn write_operational_reports(fetcher: &Fetcher, store: &ArticleStore) -> Result<()> {
    std::fs::create_dir_all(LOG_DIR)?;

    write_feed_health_csv(fetcher).await?;
    write_markdown_health_report(fetcher).await?;
    write_monthly_stats(store).await?;

    Ok(())
}

async fn write_feed_health_csv(fetcher: &Fetcher) -> Result<()> {
    let health = fetcher.health_snapshot().await;
    let mut csv = String::from("source,success_count,error_count,last_status,last_entries_count,last_error\n");
    for (name, h) in health.iter() {
        let status = format!("{:?}", h.last_status).to_uppercase();
        let last_error = h.last_error.as_deref().unwrap_or("").replace(',', ";");
        csv.push_str(&format!(
            "{name},{},{},{status},{},{last_error}\n",
            h.success_count, h.error_count, h.last_entries_count
        ));
    }
    std::fs::write(Path::new(LOG_DIR).join("feed_health.csv"), csv)?;
    Ok(())
}

async fn write_markdown_health_report(fetcher: &Fetcher) -> Result<()> {
    let markdown = fetcher.health_report_markdown().await;
    std::fs::write(Path::new(LOG_DIR).join("health_report.md"), markdown)?;
    Ok(())
}

async fn write_monthly_stats(store: &ArticleStore) -> Result<()> {
    let stats = store.category_stats().await?;
    let month_key = Utc::now().format("%Y-%m").to_string();
    let report = serde_json::json!({
        "month": month_key,
        "generated_at": Utc::now().to_rfc3339(),
        "categories": stats,
    });
    let path = Path::new(LOG_DIR).join(format!("stats_{month_key}.json"));
    std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
    Ok(())
}
