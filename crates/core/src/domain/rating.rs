use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const STRONG_BUY_LEVEL: u8 = 5;
pub const BUY_LEVEL: u8 = 4;
pub const HOLD_LEVEL: u8 = 3;
pub const SELL_LEVEL: u8 = 2;
pub const STRONG_SELL_LEVEL: u8 = 1;

/// Known brokerage actions in matching priority order.
///
/// The parser takes the first entry found anywhere in the line, not the longest
/// or left-most one, so the order here decides ambiguous lines.
pub const ACTIONS: &[(&str, u8)] = &[
    ("target lowered by", 1),
    ("target raised by", 5),
    ("reiterated by", 2),
    ("downgraded by", 1),
    ("target set by", 2),
    ("initiated by", 3),
    ("upgraded by", 5),
];

/// Known rating labels in suffix-matching priority order, with their level
/// (1 strong sell ..= 5 strong buy). More specific labels come before the
/// generic labels they end with.
pub const RATINGS: &[(&str, u8)] = &[
    ("Sector Underperform", SELL_LEVEL),
    ("Sector Outperform", STRONG_BUY_LEVEL),
    ("Market Outperform", STRONG_BUY_LEVEL),
    ("Market Perform", HOLD_LEVEL),
    ("Sector Perform", HOLD_LEVEL),
    ("Sector Weight", BUY_LEVEL),
    ("Equal Weight", BUY_LEVEL),
    ("Peer Perform", BUY_LEVEL),
    ("Outperformer", STRONG_BUY_LEVEL),
    ("Underperform", SELL_LEVEL),
    ("Underweight", SELL_LEVEL),
    ("Overweight", BUY_LEVEL),
    ("Strong-Buy", STRONG_BUY_LEVEL),
    ("Outperform", STRONG_BUY_LEVEL),
    ("Top Pick", STRONG_BUY_LEVEL),
    ("Positive", STRONG_BUY_LEVEL),
    ("Negative", SELL_LEVEL),
    ("Neutral", HOLD_LEVEL),
    ("In-Line", BUY_LEVEL),
    ("Reduce", SELL_LEVEL),
    ("Inline", BUY_LEVEL),
    ("Buy", STRONG_BUY_LEVEL),
    ("Sell", STRONG_SELL_LEVEL),
    ("Hold", HOLD_LEVEL),
];

pub fn rating_level(rating: &str) -> Option<u8> {
    RATINGS
        .iter()
        .find(|(label, _)| *label == rating)
        .map(|(_, level)| *level)
}

pub fn action_strength(action: &str) -> Option<u8> {
    ACTIONS
        .iter()
        .find(|(label, _)| *label == action)
        .map(|(_, strength)| *strength)
}

/// Display label for a mean rating level, as shown on aggregates.
pub fn bucket_label(mean_level: f64) -> &'static str {
    if mean_level >= 4.5 {
        "Strong Buy"
    } else if mean_level >= 3.5 {
        "Buy"
    } else if mean_level >= 2.5 {
        "Hold"
    } else if mean_level >= 1.5 {
        "Sell"
    } else {
        "Strong Sell"
    }
}

/// One analyst rating event.
///
/// `target_price_change` and `score` stay at zero until the record goes through
/// [`crate::scoring::apply`]. Identity is `(brokerage, ticker, rating_to, time, action)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub brokerage: String,
    pub action: String,
    pub company: String,
    pub ticker: String,
    pub rating_from: String,
    pub rating_to: String,
    pub target_from: String,
    pub target_to: String,
    pub time: NaiveDate,
    #[serde(default)]
    pub target_price_change: f64,
    #[serde(default)]
    pub score: f64,
}

impl RatingRecord {
    pub fn identity(&self) -> (&str, &str, &str, NaiveDate, &str) {
        (
            &self.brokerage,
            &self.ticker,
            &self.rating_to,
            self.time,
            &self.action,
        )
    }
}

/// Per-ticker rollup over the five most recent ratings of each brokerage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingAggregate {
    pub ticker: String,
    pub time: NaiveDate,
    pub strong_buy_ratings: i64,
    pub buy_ratings: i64,
    pub hold_ratings: i64,
    pub sell_ratings: i64,
    pub rating: String,
    /// Mean target price change, in percent.
    pub target_price_change: f64,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_follow_vocabulary() {
        assert_eq!(rating_level("Buy"), Some(STRONG_BUY_LEVEL));
        assert_eq!(rating_level("Overweight"), Some(BUY_LEVEL));
        assert_eq!(rating_level("Market Perform"), Some(HOLD_LEVEL));
        assert_eq!(rating_level("Sector Underperform"), Some(SELL_LEVEL));
        assert_eq!(rating_level("Sell"), Some(STRONG_SELL_LEVEL));
        assert_eq!(rating_level("Speculative Buy"), None);
    }

    #[test]
    fn specific_ratings_precede_their_suffixes() {
        let pos = |label: &str| RATINGS.iter().position(|(l, _)| *l == label).unwrap();
        assert!(pos("Sector Underperform") < pos("Underperform"));
        assert!(pos("Market Outperform") < pos("Outperform"));
        assert!(pos("Strong-Buy") < pos("Buy"));
        assert!(pos("Outperformer") < pos("Outperform"));
    }

    #[test]
    fn action_strengths() {
        assert_eq!(action_strength("upgraded by"), Some(5));
        assert_eq!(action_strength("initiated by"), Some(3));
        assert_eq!(action_strength("target set by"), Some(2));
        assert_eq!(action_strength("downgraded by"), Some(1));
        assert_eq!(action_strength("halted by"), None);
    }

    #[test]
    fn bucket_labels() {
        assert_eq!(bucket_label(5.0), "Strong Buy");
        assert_eq!(bucket_label(4.5), "Strong Buy");
        assert_eq!(bucket_label(4.4), "Buy");
        assert_eq!(bucket_label(3.0), "Hold");
        assert_eq!(bucket_label(2.0), "Sell");
        assert_eq!(bucket_label(1.2), "Strong Sell");
    }
}
