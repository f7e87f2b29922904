use crate::domain::rating::{RatingAggregate, RatingRecord};
use crate::storage::RatingStore;
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RatingPage {
    pub data: Vec<RatingRecord>,
    /// Ticker to resume after; empty on the last page.
    #[serde(rename = "nextPage")]
    pub next_page: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationList {
    pub data: Vec<RatingAggregate>,
}

pub fn clamp_page_size(page_size: i64) -> i64 {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

/// Read side over a `RatingStore`: keyset-paginated ratings and the
/// recommendation ranking.
#[derive(Clone)]
pub struct RatingReadService {
    store: Arc<dyn RatingStore>,
}

impl RatingReadService {
    pub fn new(store: Arc<dyn RatingStore>) -> Self {
        Self { store }
    }

    pub async fn list_ratings(
        &self,
        cursor: &str,
        page_size: i64,
        search: &str,
    ) -> anyhow::Result<RatingPage> {
        let page_size = clamp_page_size(page_size);
        let mut data = self
            .store
            .list_ratings(cursor.trim(), page_size + 1, search)
            .await?;

        let next_page = if data.len() as i64 > page_size {
            data.truncate(page_size as usize);
            data.last().map(|r| r.ticker.clone()).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(RatingPage { data, next_page })
    }

    pub async fn list_recommendations(&self, page_size: i64) -> anyhow::Result<RecommendationList> {
        let data = self
            .store
            .list_recommendations(clamp_page_size(page_size))
            .await?;
        Ok(RecommendationList { data })
    }
}
