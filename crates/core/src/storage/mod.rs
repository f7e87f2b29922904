use crate::domain::rating::{RatingAggregate, RatingRecord};
use anyhow::Context;

pub mod lock;
#[cfg(test)]
pub(crate) mod memory;
pub mod ratings;
pub mod runs;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// A record with the same identity is already stored.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

/// Persistence for rating records. Implementations enforce uniqueness on
/// `(ticker, brokerage, rating_to, time, action)`.
#[async_trait::async_trait]
pub trait RatingStore: Send + Sync {
    async fn save(&self, record: &RatingRecord) -> anyhow::Result<SaveOutcome>;

    async fn batch_save(&self, records: &[RatingRecord]) -> anyhow::Result<BatchOutcome>;

    /// Rows with `ticker > cursor` (all rows for an empty cursor), ordered by
    /// ticker, optionally restricted to a case-insensitive ticker prefix.
    async fn list_ratings(
        &self,
        cursor: &str,
        limit: i64,
        search: &str,
    ) -> anyhow::Result<Vec<RatingRecord>>;

    async fn list_recommendations(&self, limit: i64) -> anyhow::Result<Vec<RatingAggregate>>;
}

/// Half-open range `[upper(prefix), upper(prefix) + char::MAX)` matching every
/// uppercased ticker that starts with `prefix`. `None` for an empty prefix.
pub fn search_range(prefix: &str) -> Option<(String, String)> {
    let lo = prefix.trim().to_uppercase();
    if lo.is_empty() {
        return None;
    }
    let mut hi = lo.clone();
    hi.push(char::MAX);
    Some((lo, hi))
}
