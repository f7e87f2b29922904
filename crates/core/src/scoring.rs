//! Composite quality score for a single rating event.
//!
//! Five integer sub-scores are weighted and summed, then divided by 100:
//! rating change (50), current rating level (15), brokerage action (25),
//! report recency (5) and target price change magnitude (5).

use crate::domain::rating::{action_strength, rating_level, RatingRecord};
use chrono::{DateTime, NaiveTime, Utc};

const RATING_CHANGE_WEIGHT: i64 = 50;
const CURRENT_RATING_WEIGHT: i64 = 15;
const BROKERAGE_ACTION_WEIGHT: i64 = 25;
const REPORT_DATE_WEIGHT: i64 = 5;
const TARGET_PRICE_CHANGE_WEIGHT: i64 = 5;

// Action strength that carries no direction on its own ("reiterated", "target set").
const FLAT_ACTION_STRENGTH: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub target_price_change: f64,
    pub score: f64,
}

/// Scores `record` as of `now`. Same inputs always give the same result.
pub fn score_at(record: &RatingRecord, now: DateTime<Utc>) -> Score {
    let target_price_change = target_price_change(&record.target_from, &record.target_to);

    let rating_change = rating_change_score(record);
    let current_rating = level_or_zero(&record.rating_to);
    let action = brokerage_action_score(record);
    let recency = report_date_score(record, now);
    let price_change = target_price_change_score(target_price_change);

    let weighted = rating_change * RATING_CHANGE_WEIGHT
        + current_rating * CURRENT_RATING_WEIGHT
        + action * BROKERAGE_ACTION_WEIGHT
        + recency * REPORT_DATE_WEIGHT
        + price_change * TARGET_PRICE_CHANGE_WEIGHT;

    Score {
        target_price_change,
        score: weighted as f64 / 100.0,
    }
}

/// Returns `record` with its derived fields filled in.
pub fn apply(mut record: RatingRecord, now: DateTime<Utc>) -> RatingRecord {
    let scored = score_at(&record, now);
    record.target_price_change = scored.target_price_change;
    record.score = scored.score;
    record
}

/// Relative change between two dollar-formatted targets. Zero when either side
/// does not parse or the starting target is zero.
pub fn target_price_change(target_from: &str, target_to: &str) -> f64 {
    match (parse_dollars(target_from), parse_dollars(target_to)) {
        (Some(from), Some(to)) if from != 0.0 => (to - from) / from,
        (from, to) => {
            tracing::debug!(
                target_from,
                target_to,
                from_parsed = from.is_some(),
                to_parsed = to.is_some(),
                "target price change undefined; using 0"
            );
            0.0
        }
    }
}

pub fn parse_dollars(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn level_or_zero(rating: &str) -> i64 {
    rating_level(rating).map(i64::from).unwrap_or(0)
}

fn rating_change_score(record: &RatingRecord) -> i64 {
    let from = level_or_zero(&record.rating_from);
    let to = level_or_zero(&record.rating_to);

    match from.cmp(&to) {
        std::cmp::Ordering::Equal => to,
        std::cmp::Ordering::Less => 5,
        std::cmp::Ordering::Greater => 1,
    }
}

fn brokerage_action_score(record: &RatingRecord) -> i64 {
    let strength = action_strength(&record.action).map(i64::from).unwrap_or(0);
    if strength == FLAT_ACTION_STRENGTH {
        rating_change_score(record)
    } else {
        strength
    }
}

fn report_date_score(record: &RatingRecord, now: DateTime<Utc>) -> i64 {
    let reported = record.time.and_time(NaiveTime::MIN).and_utc();
    let days = (now - reported).num_seconds() as f64 / 86_400.0;

    if days <= 3.0 {
        5
    } else if days <= 7.0 {
        4
    } else if days <= 15.0 {
        3
    } else if days <= 30.0 {
        2
    } else {
        1
    }
}

fn target_price_change_score(change: f64) -> i64 {
    if change < 0.0 {
        0
    } else if change >= 0.5 {
        5
    } else if change >= 0.25 {
        3
    } else {
        1
    }
}
