use crate::config::env_or;
use crate::domain::rating::{bucket_label, RatingAggregate, RatingRecord, RATINGS};
use crate::storage::{search_range, BatchOutcome, RatingStore, SaveOutcome};
use anyhow::Context;
use chrono::NaiveDate;

const DEFAULT_INSERT_BATCH: usize = 200;

const INSERT_COLUMNS: &str = "INSERT INTO stock_rating \
    (brokerage, action, company, ticker, rating_from, rating_to, target_from, target_to, time, target_price_change, score) ";

const ON_CONFLICT: &str = " ON CONFLICT (ticker, brokerage, rating_to, time, action) DO NOTHING";

type RatingRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    NaiveDate,
    f64,
    f64,
);

type AggregateRow = (String, NaiveDate, i64, i64, i64, i64, Option<f64>, f64, f64);

#[derive(Debug, Clone)]
pub struct PgRatingStore {
    pool: sqlx::PgPool,
}

impl PgRatingStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

/// `CASE rating_to WHEN 'Buy' THEN 5 ... END` over the rating vocabulary.
fn rating_level_case() -> String {
    let mut sql = String::from("CASE rating_to");
    for (rating, level) in RATINGS {
        sql.push_str(&format!(" WHEN '{}' THEN {}", rating.replace('\'', "''"), level));
    }
    sql.push_str(" END");
    sql
}

fn recommendations_query() -> String {
    format!(
        "WITH ranked AS ( \
            SELECT ticker, time, target_price_change, score, {level} AS level, \
                   ROW_NUMBER() OVER (PARTITION BY ticker, brokerage ORDER BY time DESC, id DESC) AS rn \
            FROM stock_rating \
         ), windowed AS ( \
            SELECT ticker, \
                   MAX(time) AS time, \
                   COUNT(*) FILTER (WHERE level = 5) AS strong_buy_ratings, \
                   COUNT(*) FILTER (WHERE level = 4) AS buy_ratings, \
                   COUNT(*) FILTER (WHERE level = 3) AS hold_ratings, \
                   COUNT(*) FILTER (WHERE level IN (1, 2)) AS sell_ratings, \
                   ROUND(AVG(level)::numeric, 1)::float8 AS mean_level, \
                   ROUND((AVG(target_price_change) * 100)::numeric, 2)::float8 AS target_price_change, \
                   AVG(score)::float8 AS score \
            FROM ranked \
            WHERE rn <= 5 \
            GROUP BY ticker \
         ) \
         SELECT ticker, time, strong_buy_ratings, buy_ratings, hold_ratings, sell_ratings, \
                mean_level, target_price_change, score \
         FROM windowed \
         ORDER BY strong_buy_ratings DESC, buy_ratings DESC, target_price_change DESC, time DESC, score DESC, ticker ASC \
         LIMIT $1",
        level = rating_level_case()
    )
}

/// Keyset page over `ticker`, optionally limited to an uppercase prefix range.
fn list_ratings_query<'a>(
    cursor: &'a str,
    limit: i64,
    search: &str,
) -> sqlx::QueryBuilder<'a, sqlx::Postgres> {
    let mut qb = sqlx::QueryBuilder::new(
        "SELECT brokerage, action, company, ticker, rating_from, rating_to, target_from, target_to, \
                time, target_price_change, score \
         FROM stock_rating WHERE TRUE",
    );
    if !cursor.is_empty() {
        qb.push(" AND ticker > ").push_bind(cursor);
    }
    if let Some((lo, hi)) = search_range(search) {
        qb.push(" AND UPPER(ticker) >= ")
            .push_bind(lo)
            .push(" AND UPPER(ticker) < ")
            .push_bind(hi);
    }
    qb.push(" ORDER BY ticker ASC LIMIT ").push_bind(limit);
    qb
}

fn record_from_row(row: RatingRow) -> RatingRecord {
    let (
        brokerage,
        action,
        company,
        ticker,
        rating_from,
        rating_to,
        target_from,
        target_to,
        time,
        target_price_change,
        score,
    ) = row;

    RatingRecord {
        brokerage,
        action,
        company,
        ticker,
        rating_from,
        rating_to,
        target_from,
        target_to,
        time,
        target_price_change,
        score,
    }
}

fn aggregate_from_row(row: AggregateRow) -> RatingAggregate {
    let (ticker, time, strong_buy, buy, hold, sell, mean_level, target_price_change, score) = row;

    RatingAggregate {
        ticker,
        time,
        strong_buy_ratings: strong_buy,
        buy_ratings: buy,
        hold_ratings: hold,
        sell_ratings: sell,
        rating: mean_level.map(bucket_label).unwrap_or_default().to_string(),
        target_price_change,
        score,
    }
}

#[async_trait::async_trait]
impl RatingStore for PgRatingStore {
    async fn save(&self, record: &RatingRecord) -> anyhow::Result<SaveOutcome> {
        let sql = format!(
            "{INSERT_COLUMNS}VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11){ON_CONFLICT}"
        );
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(&record.brokerage)
            .bind(&record.action)
            .bind(&record.company)
            .bind(&record.ticker)
            .bind(&record.rating_from)
            .bind(&record.rating_to)
            .bind(&record.target_from)
            .bind(&record.target_to)
            .bind(record.time)
            .bind(record.target_price_change)
            .bind(record.score)
            .execute(&self.pool)
            .await
            .with_context(|| format!("insert stock_rating failed (ticker={})", record.ticker))?;

        Ok(if res.rows_affected() == 0 {
            SaveOutcome::Duplicate
        } else {
            SaveOutcome::Inserted
        })
    }

    async fn batch_save(&self, records: &[RatingRecord]) -> anyhow::Result<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let chunk_size: usize = env_or("STOCK_RATINGS_INSERT_BATCH", DEFAULT_INSERT_BATCH);
        anyhow::ensure!(chunk_size >= 1, "STOCK_RATINGS_INSERT_BATCH must be >= 1");

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let mut inserted: u64 = 0;
        let mut batch_idx: usize = 0;
        for chunk in records.chunks(chunk_size) {
            batch_idx += 1;
            let t0 = std::time::Instant::now();
            let mut qb = sqlx::QueryBuilder::new(INSERT_COLUMNS);
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(&r.brokerage)
                    .push_bind(&r.action)
                    .push_bind(&r.company)
                    .push_bind(&r.ticker)
                    .push_bind(&r.rating_from)
                    .push_bind(&r.rating_to)
                    .push_bind(&r.target_from)
                    .push_bind(&r.target_to)
                    .push_bind(r.time)
                    .push_bind(r.target_price_change)
                    .push_bind(r.score);
            });
            qb.push(ON_CONFLICT);

            let res = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("batch insert stock_rating failed")?;
            inserted += res.rows_affected();

            tracing::debug!(
                batch_idx,
                batch_size = chunk.len(),
                elapsed_ms = t0.elapsed().as_millis(),
                "stock_rating batch insert"
            );
        }

        tx.commit().await.context("commit transaction failed")?;

        Ok(BatchOutcome {
            inserted,
            duplicates: (records.len() as u64).saturating_sub(inserted),
        })
    }

    async fn list_ratings(
        &self,
        cursor: &str,
        limit: i64,
        search: &str,
    ) -> anyhow::Result<Vec<RatingRecord>> {
        let mut qb = list_ratings_query(cursor, limit, search);
        let rows: Vec<RatingRow> = qb
            .build_query_as()
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .context("select stock_rating failed")?;

        Ok(rows.into_iter().map(record_from_row).collect())
    }

    async fn list_recommendations(&self, limit: i64) -> anyhow::Result<Vec<RatingAggregate>> {
        let rows: Vec<AggregateRow> = sqlx::query_as(&recommendations_query())
            .persistent(false)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("select stock rating recommendations failed")?;

        Ok(rows.into_iter().map(aggregate_from_row).collect())
    }
}
