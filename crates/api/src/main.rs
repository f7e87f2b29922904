use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratings_core::ingest::coordinator::{IngestOptions, IngestionCoordinator};
use ratings_core::ingest::feed::HttpRatingFeed;
use ratings_core::read::{RatingReadService, DEFAULT_PAGE_SIZE};
use ratings_core::storage::ratings::PgRatingStore;
use ratings_core::storage::RatingStore;

const RATINGS_CACHE_CONTROL: &str = "private, max-age=900";
const RECOMMENDATIONS_CACHE_CONTROL: &str = "private, max-age=86400";
/// Extra wait on top of the ingestion drain grace before abandoning runs at shutdown.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

/// Ingestion runs spawned by the trigger endpoint.
type IngestRuns = Arc<Mutex<JoinSet<()>>>;

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

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(db_url)
            .await
        {
            Ok(pool) => match ratings_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(
                        error = %e,
                        "db migrations failed; starting API in degraded mode"
                    );
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let ingest_opts = IngestOptions::from_env();
    let services = pool.map(|pool| {
        let store: Arc<dyn RatingStore> = Arc::new(PgRatingStore::new(pool));
        let ingest = match HttpRatingFeed::from_settings(&settings) {
            Ok(feed) => Some(Arc::new(IngestionCoordinator::new(
                Arc::new(feed),
                store.clone(),
                ingest_opts.clone(),
            ))),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "rating feed not configured; ingestion endpoint disabled"
                );
                None
            }
        };
        Services {
            reads: RatingReadService::new(store),
            ingest,
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runs = IngestRuns::default();
    let app = router(AppState {
        services,
        shutdown: shutdown_rx,
        runs: runs.clone(),
    });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    wait_for_ingest_runs(&runs, ingest_opts.drain_grace + SHUTDOWN_MARGIN).await;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/health", get(healthz))
        .route("/api/stock-ratings", get(get_stock_ratings))
        .route("/api/stock-recommendations", get(get_stock_recommendations))
        .route("/api/stock-ratings-data", post(load_stock_ratings))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    services: Option<Services>,
    /// Flips to `true` on shutdown; passed to spawned ingestion runs.
    shutdown: watch::Receiver<bool>,
    runs: IngestRuns,
}

#[derive(Clone)]
struct Services {
    reads: RatingReadService,
    ingest: Option<Arc<IngestionCoordinator>>,
}

#[derive(Debug, Deserialize)]
struct RatingsQuery {
    #[serde(rename = "nextPage", default)]
    next_page: String,
    #[serde(rename = "pageSize")]
    page_size: Option<String>,
    #[serde(default)]
    search: String,
}

#[derive(Debug, Deserialize)]
struct RecommendationsQuery {
    #[serde(rename = "pageSize")]
    page_size: Option<String>,
}

fn parse_page_size(raw: Option<&str>) -> Result<i64, Response> {
    match raw {
        None => Ok(DEFAULT_PAGE_SIZE),
        Some(s) => s.trim().parse::<i64>().map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "pageSize parameter must be an integer" })),
            )
                .into_response()
        }),
    }
}

fn internal_error(err: anyhow::Error) -> Response {
    sentry_anyhow::capture_anyhow(&err);
    tracing::error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "code": "internal_server_error",
            "message": "error processing the request",
        })),
    )
        .into_response()
}

async fn get_stock_ratings(
    State(state): State<AppState>,
    Query(q): Query<RatingsQuery>,
) -> Result<Response, Response> {
    let page_size = parse_page_size(q.page_size.as_deref())?;
    let Some(services) = &state.services else {
        return Err(StatusCode::SERVICE_UNAVAILABLE.into_response());
    };

    let page = services
        .reads
        .list_ratings(&q.next_page, page_size, &q.search)
        .await
        .map_err(internal_error)?;

    Ok(([(header::CACHE_CONTROL, RATINGS_CACHE_CONTROL)], Json(page)).into_response())
}

async fn get_stock_recommendations(
    State(state): State<AppState>,
    Query(q): Query<RecommendationsQuery>,
) -> Result<Response, Response> {
    let page_size = parse_page_size(q.page_size.as_deref())?;
    let Some(services) = &state.services else {
        return Err(StatusCode::SERVICE_UNAVAILABLE.into_response());
    };

    let list = services
        .reads
        .list_recommendations(page_size)
        .await
        .map_err(internal_error)?;

    Ok(([(header::CACHE_CONTROL, RECOMMENDATIONS_CACHE_CONTROL)], Json(list)).into_response())
}

async fn load_stock_ratings(State(state): State<AppState>) -> Response {
    let Some(coordinator) = state.services.as_ref().and_then(|s| s.ingest.clone()) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let cancel = state.shutdown.clone();
    let mut runs = state.runs.lock().unwrap_or_else(PoisonError::into_inner);
    while runs.try_join_next().is_some() {}
    runs.spawn(async move {
        let report = coordinator.run(cancel).await;
        tracing::debug!(
            run_id = %report.run_id,
            outcome = report.outcome.as_str(),
            "ingestion task done"
        );
    });
    drop(runs);

    (StatusCode::ACCEPTED, Json(json!({}))).into_response()
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested; cancelling in-flight ingestion");
    let _ = shutdown.send(true);
}

/// Waits up to `grace` for spawned ingestion runs to observe the shutdown
/// signal and finish; whatever is still running afterwards is aborted.
async fn wait_for_ingest_runs(runs: &IngestRuns, grace: Duration) {
    let mut set = std::mem::take(&mut *runs.lock().unwrap_or_else(PoisonError::into_inner));
    if set.is_empty() {
        return;
    }

    tracing::info!(runs = set.len(), "waiting for in-flight ingestion to stop");
    let drain = async { while set.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            runs = set.len(),
            grace_secs = grace.as_secs(),
            "ingestion still running at shutdown; aborting"
        );
        set.abort_all();
    }
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
