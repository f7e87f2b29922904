use crate::config::{env_or, Settings};
use crate::ingest::error::FeedError;
use crate::ingest::line::LineParser;
use crate::ingest::types::{FeedPage, FeedResponse};
use anyhow::{Context, Result};
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/list";
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_MAX_ELAPSED_SECS: u64 = 60;
const DEFAULT_BACKOFF_MS: u64 = 500;

/// Source of paginated rating data.
#[async_trait::async_trait]
pub trait RatingFeed: Send + Sync {
    fn feed_name(&self) -> &'static str;

    /// Fetches the page at `cursor` (empty for the first page).
    async fn fetch_page(&self, cursor: &str) -> Result<FeedPage, FeedError>;
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub path: String,
    /// Plain-text format name; JSON is requested when unset.
    pub format: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub max_elapsed: Duration,
    pub backoff: Duration,
}

impl FeedOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_feed_base_url()?.to_string();

        let path = std::env::var("STOCK_RATING_API_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        Ok(Self {
            base_url,
            auth_token: settings.feed_auth_token.clone(),
            path,
            format: settings.feed_format.clone(),
            timeout: Duration::from_secs(env_or(
                "STOCK_RATING_API_TIMEOUT_SECS",
                DEFAULT_TIMEOUT_SECS,
            )),
            retries: env_or("STOCK_RATING_API_RETRIES", DEFAULT_RETRIES).max(1),
            max_elapsed: Duration::from_secs(env_or(
                "STOCK_RATING_API_MAX_ELAPSED_SECS",
                DEFAULT_MAX_ELAPSED_SECS,
            )),
            backoff: Duration::from_millis(env_or(
                "STOCK_RATING_API_BACKOFF_MS",
                DEFAULT_BACKOFF_MS,
            )),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpRatingFeed {
    http: reqwest::Client,
    parser: LineParser,
    opts: FeedOptions,
}

impl HttpRatingFeed {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(FeedOptions::from_settings(settings)?)
    }

    pub fn new(opts: FeedOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .build()
            .context("failed to build rating feed http client")?;

        Ok(Self {
            http,
            parser: LineParser::new()?,
            opts,
        })
    }

    fn url(&self) -> String {
        let path = if self.opts.path.starts_with('/') {
            self.opts.path.clone()
        } else {
            format!("/{}", self.opts.path)
        };

        format!("{}{}", self.opts.base_url.trim_end_matches('/'), path)
    }

    async fn fetch_once(&self, cursor: &str) -> Result<FeedPage, FeedError> {
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(2);
        if let Some(format) = self.opts.format.as_deref() {
            query.push(("format", format));
        }
        if !cursor.is_empty() {
            query.push(("next_page", cursor));
        }

        let mut req = self.http.get(self.url()).query(&query);
        if let Some(token) = self.opts.auth_token.as_deref() {
            req = req.bearer_auth(token);
        }

        let res = req.send().await.map_err(FeedError::Transport)?;
        let status = res.status();
        let body = res.text().await;

        if !status.is_success() {
            return Err(FeedError::Status {
                status,
                body: body.unwrap_or_default(),
            });
        }

        let body = body.map_err(|e| FeedError::Decode(format!("failed to read body: {e}")))?;
        if self.opts.format.is_some() {
            Ok(self.decode_text(&body))
        } else {
            let parsed = serde_json::from_str::<FeedResponse>(&body)
                .map_err(|e| FeedError::Decode(e.to_string()))?;
            Ok(parsed.into())
        }
    }

    /// First line is the next cursor; every following line carrying a `$` is a
    /// record. Lines that fail to parse are skipped.
    fn decode_text(&self, body: &str) -> FeedPage {
        let mut lines = body.lines();
        let next_page = lines.next().unwrap_or_default().trim().to_string();

        let mut items = Vec::new();
        let mut skipped: usize = 0;
        for line in lines.filter(|l| l.contains('$')) {
            match self.parser.parse(line.trim()) {
                Ok(record) => items.push(record),
                Err(err) => {
                    skipped += 1;
                    tracing::warn!(error = %err, "skipping malformed rating line");
                }
            }
        }

        if skipped > 0 {
            tracing::debug!(parsed = items.len(), skipped, "decoded text feed page");
        }

        FeedPage { items, next_page }
    }
}

/// Delay before retry number `attempt`, doubling each time and saturating
/// instead of overflowing.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

#[async_trait::async_trait]
impl RatingFeed for HttpRatingFeed {
    fn feed_name(&self) -> &'static str {
        "stock_rating_api"
    }

    async fn fetch_page(&self, cursor: &str) -> Result<FeedPage, FeedError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.fetch_once(cursor).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            if err.is_permanent() {
                tracing::error!(
                    attempt,
                    cursor,
                    error = %err,
                    "rating feed fetch failed permanently"
                );
                return Err(err);
            }
            if attempt >= self.opts.retries {
                return Err(err);
            }

            let backoff = backoff_delay(self.opts.backoff, attempt);
            if started.elapsed().saturating_add(backoff) > self.opts.max_elapsed {
                tracing::warn!(attempt, cursor, error = %err, "rating feed retry budget exhausted");
                return Err(err);
            }

            tracing::warn!(
                attempt,
                ?backoff,
                cursor,
                error = %err,
                "rating feed fetch failed; retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Hits = Arc<AtomicUsize>;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn options(base_url: String, format: Option<&str>) -> FeedOptions {
        FeedOptions {
            base_url,
            auth_token: Some("secret".to_string()),
            path: "list".to_string(),
            format: format.map(str::to_string),
            timeout: Duration::from_secs(5),
            retries: 3,
            max_elapsed: Duration::from_secs(60),
            backoff: Duration::from_millis(1),
        }
    }

    fn feed(base_url: String, format: Option<&str>) -> HttpRatingFeed {
        HttpRatingFeed::new(options(base_url, format)).unwrap()
    }

    async fn always(status: StatusCode) -> (String, Hits) {
        let hits = Hits::default();
        let counter = hits.clone();
        let app = Router::new().route(
            "/list",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    status.into_response()
                }
            }),
        );
        (serve(app).await, hits)
    }

    fn json_page(next_page: &str) -> serde_json::Value {
        json!({
            "next_page": next_page,
            "items": [{
                "brokerage": "Benchmark",
                "action": "reiterated by",
                "company": "Hello Group",
                "ticker": "MOMO",
                "rating_from": "Buy",
                "rating_to": "Buy",
                "target_from": "$13.00",
                "target_to": "$13.00",
                "time": "2025-03-14T00:30:05Z"
            }]
        })
    }

    #[tokio::test]
    async fn sends_bearer_token_and_cursor() {
        async fn handler(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Response {
            let authorized = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some("Bearer secret");
            if !authorized || q.get("next_page").map(String::as_str) != Some("MOMO") {
                return StatusCode::BAD_REQUEST.into_response();
            }
            axum::Json(json_page("NVDA")).into_response()
        }

        let base = serve(Router::new().route("/list", get(handler))).await;
        let page = feed(base, None).fetch_page("MOMO").await.unwrap();
        assert_eq!(page.next_page, "NVDA");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].company, "Hello Group");
    }

    #[tokio::test]
    async fn omits_cursor_on_first_page() {
        async fn handler(Query(q): Query<HashMap<String, String>>) -> Response {
            if q.contains_key("next_page") {
                return StatusCode::BAD_REQUEST.into_response();
            }
            axum::Json(json_page("")).into_response()
        }

        let base = serve(Router::new().route("/list", get(handler))).await;
        let page = feed(base, None).fetch_page("").await.unwrap();
        assert!(page.next_page.is_empty());
    }

    #[tokio::test]
    async fn decodes_text_format_and_skips_bad_lines() {
        async fn handler(Query(q): Query<HashMap<String, String>>) -> Response {
            if q.get("format").map(String::as_str) != Some("text") {
                return StatusCode::BAD_REQUEST.into_response();
            }
            let body = [
                "CURSOR2",
                "ticker target_from target_to company action brokerage",
                "MOMO$13.00$13.00HelloGroupreiteratedbyBenchmarkBuyBuyFriMar14202500:30UTC",
                "BAD$1.00$2.00NoActionHereBuyBuyFriMar14202500:30UTC",
                "",
                "BLND$3.85$3.50BlendLabstargetloweredbyKeefe,Bruyette&WoodsMarketPerformMarketPerformTueMar04202500:30UTC",
            ]
            .join("\n");
            (StatusCode::OK, body).into_response()
        }

        let base = serve(Router::new().route("/list", get(handler))).await;
        let page = feed(base, Some("text")).fetch_page("").await.unwrap();
        assert_eq!(page.next_page, "CURSOR2");
        let tickers: Vec<_> = page.items.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["MOMO", "BLND"]);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        async fn handler(State(hits): State<Hits>) -> Response {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::UNAUTHORIZED.into_response()
        }

        let hits = Hits::default();
        let app = Router::new()
            .route("/list", get(handler))
            .with_state(hits.clone());
        let base = serve(app).await;

        let err = feed(base, None).fetch_page("").await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried_up_to_limit() {
        async fn handler(State(hits): State<Hits>) -> Response {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }

        let hits = Hits::default();
        let app = Router::new()
            .route("/list", get(handler))
            .with_state(hits.clone());
        let base = serve(app).await;

        let err = feed(base, None).fetch_page("").await.unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        async fn handler(State(hits): State<Hits>) -> Response {
            if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            axum::Json(json_page("")).into_response()
        }

        let hits = Hits::default();
        let app = Router::new()
            .route("/list", get(handler))
            .with_state(hits.clone());
        let base = serve(app).await;

        let page = feed(base, None).fetch_page("").await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_json_is_permanent() {
        async fn handler(State(hits): State<Hits>) -> Response {
            hits.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, "{not json").into_response()
        }

        let hits = Hits::default();
        let app = Router::new()
            .route("/list", get(handler))
            .with_state(hits.clone());
        let base = serve(app).await;

        let err = feed(base, None).fetch_page("").await.unwrap_err();
        assert!(matches!(err, FeedError::Decode(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 40), Duration::MAX);
        assert_eq!(backoff_delay(Duration::ZERO, 40), Duration::ZERO);
    }

    #[tokio::test]
    async fn many_retries_do_not_overflow_backoff() {
        let (base, hits) = always(StatusCode::BAD_GATEWAY).await;
        let feed = HttpRatingFeed::new(FeedOptions {
            retries: 40,
            backoff: Duration::ZERO,
            max_elapsed: Duration::from_secs(600),
            ..options(base, None)
        })
        .unwrap();

        let err = feed.fetch_page("").await.unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(hits.load(Ordering::SeqCst), 40);
    }

    #[tokio::test]
    async fn stops_retrying_when_elapsed_budget_is_spent() {
        let (base, hits) = always(StatusCode::SERVICE_UNAVAILABLE).await;
        let feed = HttpRatingFeed::new(FeedOptions {
            backoff: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(1),
            ..options(base, None)
        })
        .unwrap();

        let started = Instant::now();
        let err = feed.fetch_page("").await.unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
