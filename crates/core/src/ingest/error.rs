use reqwest::StatusCode;
use thiserror::Error;

/// Why a plain-text feed line could not be turned into a rating record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid stock rating format: date not found in '{0}'")]
    DateNotFound(String),
    #[error("invalid stock rating format: ticker/targets not matched in '{0}'")]
    TickerTargetsNotMatched(String),
    #[error("action not found in '{0}'")]
    ActionNotFound(String),
    #[error("ratingTo not found in '{0}'")]
    RatingToNotFound(String),
    #[error("ratingFrom not found in '{0}'")]
    RatingFromNotFound(String),
    #[error("invalid date '{0}'")]
    InvalidDate(String),
}

/// Failure fetching one page from the ratings feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("feed HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode feed response: {0}")]
    Decode(String),
}

impl FeedError {
    /// Permanent errors are not retried: client errors and undecodable bodies
    /// will fail the same way again.
    pub fn is_permanent(&self) -> bool {
        match self {
            FeedError::Status { status, .. } => status.is_client_error(),
            FeedError::Decode(_) => true,
            FeedError::Transport(_) => false,
        }
    }
}
