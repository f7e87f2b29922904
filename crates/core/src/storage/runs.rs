use crate::ingest::coordinator::IngestReport;
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Records a finished ingestion pass, keyed by its run id.
pub async fn record_ingest_run(pool: &sqlx::PgPool, report: &IngestReport) -> anyhow::Result<Uuid> {
    let finished_at: DateTime<Utc> = report.started_at
        + chrono::Duration::from_std(report.elapsed).unwrap_or_else(|_| chrono::Duration::zero());

    sqlx::query(
        "INSERT INTO stock_rating_ingest_runs \
         (id, started_at, finished_at, feed, mode, outcome, pages, fetched, inserted, duplicates, failed, error) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .persistent(false)
    .bind(report.run_id)
    .bind(report.started_at)
    .bind(finished_at)
    .bind(report.feed)
    .bind(report.mode.as_str())
    .bind(report.outcome.as_str())
    .bind(report.pages as i64)
    .bind(report.fetched as i64)
    .bind(report.inserted as i64)
    .bind(report.duplicates as i64)
    .bind(report.failed as i64)
    .bind(report.outcome.error())
    .execute(pool)
    .await
    .context("insert stock_rating_ingest_runs failed")?;

    Ok(report.run_id)
}
