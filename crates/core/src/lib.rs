pub mod domain;
pub mod ingest;
pub mod read;
pub mod scoring;
pub mod storage;

pub mod config {
    use anyhow::Context;
    use std::str::FromStr;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub feed_base_url: Option<String>,
        pub feed_auth_token: Option<String>,
        /// Plain-text feed format; the JSON feed is used when unset.
        pub feed_format: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: non_empty_var("DATABASE_URL"),
                sentry_dsn: non_empty_var("SENTRY_DSN"),
                feed_base_url: non_empty_var("STOCK_RATING_API_URL"),
                feed_auth_token: non_empty_var("STOCK_RATING_API_AUTH_TOKEN"),
                feed_format: non_empty_var("STOCK_RATING_API_FORMAT"),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_feed_base_url(&self) -> anyhow::Result<&str> {
            self.feed_base_url
                .as_deref()
                .context("STOCK_RATING_API_URL is required")
        }
    }

    fn non_empty_var(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Reads a tunable from the environment, falling back to `default` when it
    /// is unset or does not parse.
    pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default)
    }
}
