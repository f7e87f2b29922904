use crate::domain::rating::RatingRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of the ratings feed, already converted to records.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub items: Vec<RatingRecord>,
    /// Empty at the end of the feed.
    pub next_page: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedResponse {
    #[serde(default)]
    pub next_page: String,
    #[serde(default)]
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub brokerage: String,
    pub action: String,
    pub company: String,
    pub ticker: String,
    pub rating_from: String,
    pub rating_to: String,
    pub target_from: String,
    pub target_to: String,
    pub time: DateTime<Utc>,
}

impl From<FeedItem> for RatingRecord {
    fn from(item: FeedItem) -> Self {
        RatingRecord {
            brokerage: item.brokerage.trim().to_string(),
            action: item.action.trim().to_string(),
            company: item.company.trim().to_string(),
            ticker: item.ticker.trim().to_string(),
            rating_from: item.rating_from.trim().to_string(),
            rating_to: item.rating_to.trim().to_string(),
            target_from: item.target_from.trim().to_string(),
            target_to: item.target_to.trim().to_string(),
            time: item.time.date_naive(),
            target_price_change: 0.0,
            score: 0.0,
        }
    }
}

impl From<FeedResponse> for FeedPage {
    fn from(resp: FeedResponse) -> Self {
        FeedPage {
            items: resp.items.into_iter().map(RatingRecord::from).collect(),
            next_page: resp.next_page.trim().to_string(),
        }
    }
}
