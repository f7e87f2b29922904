//! Full-feed ingestion pass.
//!
//! A single producer walks the feed cursor by cursor, scores every record and
//! hands it to persistence: either a bounded queue drained by a fixed pool of
//! workers (one `save` per record) or one `batch_save` per page. At most one
//! pass runs at a time per coordinator.

use crate::config::env_or;
use crate::domain::rating::RatingRecord;
use crate::ingest::error::FeedError;
use crate::ingest::feed::RatingFeed;
use crate::ingest::types::FeedPage;
use crate::scoring;
use crate::storage::{RatingStore, SaveOutcome};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DRAIN_GRACE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Bounded queue drained by a worker pool, one insert per record.
    Workers,
    /// One multi-row insert per feed page.
    Batch,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestMode::Workers => "workers",
            IngestMode::Batch => "batch",
        }
    }
}

impl FromStr for IngestMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "workers" | "worker" | "pool" => Ok(IngestMode::Workers),
            "batch" => Ok(IngestMode::Batch),
            other => anyhow::bail!("unknown ingest mode '{other}' (expected workers|batch)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub mode: IngestMode,
    pub workers: usize,
    /// Queue capacity is `workers * batch_size`.
    pub batch_size: usize,
    pub run_timeout: Duration,
    pub drain_grace: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            mode: IngestMode::Workers,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            drain_grace: Duration::from_secs(DEFAULT_DRAIN_GRACE_SECS),
        }
    }
}

impl IngestOptions {
    pub fn from_env() -> Self {
        let mode = std::env::var("INGEST_MODE")
            .ok()
            .and_then(|s| match s.parse::<IngestMode>() {
                Ok(mode) => Some(mode),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring INGEST_MODE");
                    None
                }
            })
            .unwrap_or(IngestMode::Workers);

        Self {
            mode,
            workers: env_or("INGEST_WORKERS", DEFAULT_WORKERS).max(1),
            batch_size: env_or("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            run_timeout: Duration::from_secs(env_or(
                "INGEST_RUN_TIMEOUT_SECS",
                DEFAULT_RUN_TIMEOUT_SECS,
            )),
            drain_grace: Duration::from_secs(env_or(
                "INGEST_DRAIN_GRACE_SECS",
                DEFAULT_DRAIN_GRACE_SECS,
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed,
    /// Another pass held the guard; nothing was done.
    AlreadyRunning,
    /// The feed returned an error; pages persisted before it are kept.
    FeedFailed(String),
    Cancelled,
    TimedOut,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Completed => "completed",
            IngestOutcome::AlreadyRunning => "already_running",
            IngestOutcome::FeedFailed(_) => "feed_failed",
            IngestOutcome::Cancelled => "cancelled",
            IngestOutcome::TimedOut => "timed_out",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            IngestOutcome::FeedFailed(msg) => Some(msg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub feed: &'static str,
    pub mode: IngestMode,
    pub started_at: DateTime<Utc>,
    pub outcome: IngestOutcome,
    pub pages: u64,
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    pages: AtomicU64,
    fetched: AtomicU64,
    inserted: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Clears the in-progress flag when the pass ends, including on panic.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct IngestionCoordinator {
    feed: Arc<dyn RatingFeed>,
    store: Arc<dyn RatingStore>,
    opts: IngestOptions,
    running: AtomicBool,
}

impl IngestionCoordinator {
    pub fn new(
        feed: Arc<dyn RatingFeed>,
        store: Arc<dyn RatingStore>,
        opts: IngestOptions,
    ) -> Self {
        Self {
            feed,
            store,
            opts,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_start(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                flag: &self.running,
            })
    }

    /// Runs one ingestion pass. `cancel` flipping to `true` stops the pass at
    /// the next page boundary or enqueue and aborts an in-flight fetch.
    ///
    /// Never fails: feed, persistence, timeout and cancellation problems are
    /// logged and reflected in the returned report.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> IngestReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let t0 = Instant::now();
        let counters = Counters::default();

        let Some(_guard) = self.try_start() else {
            tracing::info!(%run_id, "stock rating ingestion already in progress; skipping");
            return self.report(run_id, started_at, t0, IngestOutcome::AlreadyRunning, &counters);
        };

        tracing::info!(
            %run_id,
            feed = self.feed.feed_name(),
            mode = self.opts.mode.as_str(),
            "stock rating ingestion started"
        );

        let deadline = t0 + self.opts.run_timeout;
        let counters = Arc::new(counters);
        let outcome = match self.opts.mode {
            IngestMode::Workers => self.run_workers(&mut cancel, deadline, &counters).await,
            IngestMode::Batch => self.run_batch(&mut cancel, deadline, &counters).await,
        };

        let report = self.report(run_id, started_at, t0, outcome, &counters);
        match &report.outcome {
            IngestOutcome::Completed => tracing::info!(
                %run_id,
                pages = report.pages,
                fetched = report.fetched,
                inserted = report.inserted,
                duplicates = report.duplicates,
                failed = report.failed,
                elapsed_ms = report.elapsed.as_millis(),
                "stock rating ingestion finished"
            ),
            outcome => tracing::warn!(
                %run_id,
                outcome = outcome.as_str(),
                error = outcome.error().unwrap_or_default(),
                pages = report.pages,
                fetched = report.fetched,
                inserted = report.inserted,
                duplicates = report.duplicates,
                failed = report.failed,
                elapsed_ms = report.elapsed.as_millis(),
                "stock rating ingestion stopped early"
            ),
        }

        report
    }

    fn report(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        t0: Instant,
        outcome: IngestOutcome,
        counters: &Counters,
    ) -> IngestReport {
        IngestReport {
            run_id,
            feed: self.feed.feed_name(),
            mode: self.opts.mode,
            started_at,
            outcome,
            pages: Counters::get(&counters.pages),
            fetched: Counters::get(&counters.fetched),
            inserted: Counters::get(&counters.inserted),
            duplicates: Counters::get(&counters.duplicates),
            failed: Counters::get(&counters.failed),
            elapsed: t0.elapsed(),
        }
    }

    /// Fetches and scores one page, abandoning the fetch on cancellation or at
    /// the deadline.
    async fn next_page(
        &self,
        cursor: &str,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<FeedPage, IngestOutcome> {
        if *cancel.borrow() {
            return Err(IngestOutcome::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(IngestOutcome::TimedOut);
        }

        let res = tokio::select! {
            res = self.feed.fetch_page(cursor) => res,
            _ = cancelled(cancel) => return Err(IngestOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(IngestOutcome::TimedOut),
        };

        match res {
            Ok(mut page) => {
                let now = Utc::now();
                page.items = page
                    .items
                    .into_iter()
                    .map(|r| scoring::apply(r, now))
                    .collect();
                Ok(page)
            }
            Err(err) => {
                tracing::error!(cursor, error = %err, "stock rating feed failed; aborting run");
                Err(IngestOutcome::FeedFailed(err.to_string()))
            }
        }
    }

    async fn run_batch(
        &self,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
        counters: &Counters,
    ) -> IngestOutcome {
        let mut cursor = String::new();
        loop {
            let page = match self.next_page(&cursor, cancel, deadline).await {
                Ok(page) => page,
                Err(outcome) => return outcome,
            };
            Counters::add(&counters.pages, 1);
            Counters::add(&counters.fetched, page.items.len() as u64);

            match self.store.batch_save(&page.items).await {
                Ok(saved) => {
                    Counters::add(&counters.inserted, saved.inserted);
                    Counters::add(&counters.duplicates, saved.duplicates);
                    if saved.duplicates > 0 {
                        tracing::info!(
                            cursor = %cursor,
                            duplicates = saved.duplicates,
                            "skipping duplicate stock ratings; probably loading the same data again"
                        );
                    }
                }
                Err(err) => {
                    Counters::add(&counters.failed, page.items.len() as u64);
                    tracing::error!(
                        cursor = %cursor,
                        records = page.items.len(),
                        error = %format!("{err:#}"),
                        "failed to save stock rating page"
                    );
                }
            }

            if page.next_page.is_empty() {
                return IngestOutcome::Completed;
            }
            cursor = page.next_page;
        }
    }

    async fn run_workers(
        &self,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
        counters: &Arc<Counters>,
    ) -> IngestOutcome {
        let (tx, rx) = mpsc::channel::<RatingRecord>(self.opts.workers * self.opts.batch_size);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.opts.workers);
        for worker_id in 0..self.opts.workers {
            handles.push(tokio::spawn(persist_worker(
                worker_id,
                rx.clone(),
                self.store.clone(),
                counters.clone(),
            )));
        }

        // Dropping the sender inside `produce` closes the queue; workers exit
        // once it is drained.
        let outcome = self.produce(tx, cancel, deadline, counters).await;

        let drain = async {
            for handle in handles.iter_mut() {
                if let Err(err) = handle.await {
                    tracing::error!(error = %err, "stock rating worker panicked");
                }
            }
        };

        match tokio::time::timeout(self.opts.drain_grace, drain).await {
            Ok(()) => outcome,
            Err(_) => {
                tracing::warn!(
                    grace_secs = self.opts.drain_grace.as_secs(),
                    "stock rating workers did not drain in time; abandoning them"
                );
                match outcome {
                    IngestOutcome::Completed => IngestOutcome::TimedOut,
                    other => other,
                }
            }
        }
    }

    async fn produce(
        &self,
        tx: mpsc::Sender<RatingRecord>,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
        counters: &Counters,
    ) -> IngestOutcome {
        let mut cursor = String::new();
        loop {
            let page = match self.next_page(&cursor, cancel, deadline).await {
                Ok(page) => page,
                Err(outcome) => return outcome,
            };
            Counters::add(&counters.pages, 1);
            Counters::add(&counters.fetched, page.items.len() as u64);

            for record in page.items {
                tokio::select! {
                    biased;
                    _ = cancelled(cancel) => return IngestOutcome::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => return IngestOutcome::TimedOut,
                    sent = tx.send(record) => {
                        if let Err(mpsc::error::SendError(record)) = sent {
                            Counters::add(&counters.failed, 1);
                            tracing::error!(
                                ticker = %record.ticker,
                                "no stock rating worker left to save record"
                            );
                        }
                    }
                }
            }

            if page.next_page.is_empty() {
                return IngestOutcome::Completed;
            }
            cursor = page.next_page;
        }
    }
}

async fn persist_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<RatingRecord>>>,
    store: Arc<dyn RatingStore>,
    counters: Arc<Counters>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(record) = next else {
            break;
        };

        match store.save(&record).await {
            Ok(SaveOutcome::Inserted) => Counters::add(&counters.inserted, 1),
            Ok(SaveOutcome::Duplicate) => {
                Counters::add(&counters.duplicates, 1);
                tracing::info!(
                    worker_id,
                    ticker = %record.ticker,
                    brokerage = %record.brokerage,
                    time = %record.time,
                    "skipping duplicate stock rating; probably loading the same data again"
                );
            }
            Err(err) => {
                Counters::add(&counters.failed, 1);
                tracing::error!(
                    worker_id,
                    ticker = %record.ticker,
                    error = %format!("{err:#}"),
                    "failed to save stock rating"
                );
            }
        }
    }

    tracing::debug!(worker_id, "stock rating worker finished");
}

/// Fetches and scores the first page of `feed` without persisting anything.
pub async fn preview_first_page(feed: &dyn RatingFeed) -> Result<FeedPage, FeedError> {
    let mut page = feed.fetch_page("").await?;
    let now = Utc::now();
    page.items = page
        .items
        .into_iter()
        .map(|r| scoring::apply(r, now))
        .collect();
    Ok(page)
}

/// Resolves once `cancel` is `true`. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
