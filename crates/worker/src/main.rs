use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratings_core::ingest::coordinator::{
    preview_first_page, IngestMode, IngestOptions, IngestOutcome, IngestionCoordinator,
};
use ratings_core::ingest::feed::{HttpRatingFeed, RatingFeed};
use ratings_core::storage::ratings::PgRatingStore;
use ratings_core::storage::RatingStore;

#[derive(Debug, Parser)]
#[command(name = "ratings_worker")]
struct Args {
    /// Fetch, parse and score the first feed page, then log instead of storing.
    #[arg(long)]
    dry_run: bool,

    /// Persistence mode (workers|batch). Defaults to INGEST_MODE or workers.
    #[arg(long)]
    mode: Option<IngestMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = ratings_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let feed: Arc<dyn RatingFeed> = Arc::new(HttpRatingFeed::from_settings(&settings)?);

    let mut opts = IngestOptions::from_env();
    if let Some(mode) = args.mode {
        opts.mode = mode;
    }

    if args.dry_run {
        return dry_run(feed.as_ref()).await;
    }

    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections((opts.workers as u32).saturating_add(2))
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    ratings_core::storage::migrate(&pool).await?;

    let Some(lock) = ratings_core::storage::lock::try_acquire_ingest_lock(&pool).await? else {
        tracing::warn!("ingest lock not acquired; another worker run in progress");
        return Ok(());
    };

    let store: Arc<dyn RatingStore> = Arc::new(PgRatingStore::new(pool.clone()));
    let coordinator = IngestionCoordinator::new(feed, store, opts);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling ingestion");
            let _ = cancel_tx.send(true);
        }
    });

    let report = coordinator.run(cancel_rx).await;

    match ratings_core::storage::runs::record_ingest_run(&pool, &report).await {
        Ok(run_id) => tracing::info!(
            %run_id,
            outcome = report.outcome.as_str(),
            "recorded ingest run"
        ),
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %format!("{err:#}"), "failed to record ingest run");
        }
    }

    if let Err(err) = lock.release().await {
        tracing::warn!(error = %err, "failed to release ingest lock");
    }

    if let IngestOutcome::FeedFailed(msg) = &report.outcome {
        let err = anyhow::anyhow!("stock rating ingestion failed: {msg}");
        sentry_anyhow::capture_anyhow(&err);
        return Err(err);
    }

    Ok(())
}

async fn dry_run(feed: &dyn RatingFeed) -> anyhow::Result<()> {
    let page = preview_first_page(feed)
        .await
        .context("dry-run: fetching first feed page failed")?;

    for record in &page.items {
        tracing::info!(
            ticker = %record.ticker,
            brokerage = %record.brokerage,
            action = %record.action,
            rating_from = %record.rating_from,
            rating_to = %record.rating_to,
            time = %record.time,
            target_price_change = record.target_price_change,
            score = record.score,
            "dry-run: would store stock rating"
        );
    }

    tracing::info!(
        dry_run = true,
        records = page.items.len(),
        next_page = %page.next_page,
        "dry-run: first feed page scored"
    );
    Ok(())
}

fn init_sentry(settings: &ratings_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
