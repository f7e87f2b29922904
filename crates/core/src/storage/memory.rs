use crate::domain::rating::{
    bucket_label, rating_level, RatingAggregate, RatingRecord, BUY_LEVEL, HOLD_LEVEL, SELL_LEVEL,
    STRONG_BUY_LEVEL,
};
use crate::storage::{search_range, BatchOutcome, RatingStore, SaveOutcome};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process `RatingStore` with the same identity key and ordering as the
/// Postgres store.
#[derive(Debug, Default)]
pub(crate) struct MemoryRatingStore {
    rows: Mutex<Vec<RatingRecord>>,
    fail_ticker: Option<String>,
}

impl MemoryRatingStore {
    /// Every write touching `ticker` fails.
    pub(crate) fn failing_on(ticker: &str) -> Self {
        Self {
            fail_ticker: Some(ticker.to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn with_records(records: Vec<RatingRecord>) -> Self {
        Self {
            rows: Mutex::new(records),
            ..Default::default()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub(crate) fn records(&self) -> Vec<RatingRecord> {
        self.rows.lock().unwrap().clone()
    }

    fn check(&self, record: &RatingRecord) -> anyhow::Result<()> {
        if self.fail_ticker.as_deref() == Some(record.ticker.as_str()) {
            anyhow::bail!("simulated write failure for {}", record.ticker);
        }
        Ok(())
    }

    fn insert(rows: &mut Vec<RatingRecord>, record: &RatingRecord) -> SaveOutcome {
        if rows.iter().any(|r| r.identity() == record.identity()) {
            SaveOutcome::Duplicate
        } else {
            rows.push(record.clone());
            SaveOutcome::Inserted
        }
    }
}

fn round_to(v: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (v * factor).round() / factor
}

fn aggregate(ticker: &str, window: &[&RatingRecord]) -> RatingAggregate {
    let levels: Vec<u8> = window.iter().filter_map(|r| rating_level(&r.rating_to)).collect();
    let count = |pred: fn(u8) -> bool| levels.iter().filter(|l| pred(**l)).count() as i64;
    let n = window.len() as f64;

    let rating = if levels.is_empty() {
        String::new()
    } else {
        let mean = levels.iter().map(|l| f64::from(*l)).sum::<f64>() / levels.len() as f64;
        bucket_label(round_to(mean, 1)).to_string()
    };

    RatingAggregate {
        ticker: ticker.to_string(),
        time: window.iter().map(|r| r.time).max().unwrap_or_default(),
        strong_buy_ratings: count(|l| l == STRONG_BUY_LEVEL),
        buy_ratings: count(|l| l == BUY_LEVEL),
        hold_ratings: count(|l| l == HOLD_LEVEL),
        sell_ratings: count(|l| l <= SELL_LEVEL),
        rating,
        target_price_change: round_to(
            window.iter().map(|r| r.target_price_change).sum::<f64>() / n * 100.0,
            2,
        ),
        score: window.iter().map(|r| r.score).sum::<f64>() / n,
    }
}

#[async_trait::async_trait]
impl RatingStore for MemoryRatingStore {
    async fn save(&self, record: &RatingRecord) -> anyhow::Result<SaveOutcome> {
        self.check(record)?;
        let mut rows = self.rows.lock().unwrap();
        Ok(Self::insert(&mut rows, record))
    }

    async fn batch_save(&self, records: &[RatingRecord]) -> anyhow::Result<BatchOutcome> {
        for record in records {
            self.check(record)?;
        }

        let mut rows = self.rows.lock().unwrap();
        let mut out = BatchOutcome::default();
        for record in records {
            match Self::insert(&mut rows, record) {
                SaveOutcome::Inserted => out.inserted += 1,
                SaveOutcome::Duplicate => out.duplicates += 1,
            }
        }
        Ok(out)
    }

    async fn list_ratings(
        &self,
        cursor: &str,
        limit: i64,
        search: &str,
    ) -> anyhow::Result<Vec<RatingRecord>> {
        let range = search_range(search);
        let mut out: Vec<RatingRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| cursor.is_empty() || r.ticker.as_str() > cursor)
            .filter(|r| match &range {
                Some((lo, hi)) => {
                    let upper = r.ticker.to_uppercase();
                    upper >= *lo && upper < *hi
                }
                None => true,
            })
            .cloned()
            .collect();

        out.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn list_recommendations(&self, limit: i64) -> anyhow::Result<Vec<RatingAggregate>> {
        let rows = self.rows.lock().unwrap();

        // Newest first; later inserts win ties.
        let mut by_pair: BTreeMap<(&str, &str), Vec<(usize, &RatingRecord)>> = BTreeMap::new();
        for (idx, r) in rows.iter().enumerate() {
            by_pair
                .entry((r.ticker.as_str(), r.brokerage.as_str()))
                .or_default()
                .push((idx, r));
        }

        let mut windows: BTreeMap<&str, Vec<&RatingRecord>> = BTreeMap::new();
        for ((ticker, _), mut ratings) in by_pair {
            ratings.sort_by(|(ia, a), (ib, b)| b.time.cmp(&a.time).then(ib.cmp(ia)));
            windows
                .entry(ticker)
                .or_default()
                .extend(ratings.into_iter().take(5).map(|(_, r)| r));
        }

        let mut out: Vec<RatingAggregate> = windows
            .into_iter()
            .map(|(ticker, window)| aggregate(ticker, &window))
            .collect();

        out.sort_by(|a, b| {
            b.strong_buy_ratings
                .cmp(&a.strong_buy_ratings)
                .then(b.buy_ratings.cmp(&a.buy_ratings))
                .then(b.target_price_change.total_cmp(&a.target_price_change))
                .then(b.time.cmp(&a.time))
                .then(b.score.total_cmp(&a.score))
                .then(a.ticker.cmp(&b.ticker))
        });
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}
