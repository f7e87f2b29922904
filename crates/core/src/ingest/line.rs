//! Parser for the concatenated plain-text feed format.
//!
//! A line looks like
//! `MOMO$13.00$13.00HelloGroupreiteratedbyBenchmarkBuyBuyFriMar14202500:30UTC`:
//! ticker, two dollar targets, then company, action, brokerage, rating from and
//! rating to with all spaces removed, and a trailing timestamp.

use crate::domain::rating::{RatingRecord, ACTIONS, RATINGS};
use crate::ingest::error::ParseError;
use anyhow::Context;
use chrono::{NaiveDate, NaiveTime};
use regex::Regex;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone)]
pub struct LineParser {
    date_re: Regex,
    parts_re: Regex,
}

struct DateToken<'a> {
    start: usize,
    text: &'a str,
    month: &'a str,
    day: &'a str,
    year: &'a str,
    hour: &'a str,
    minute: &'a str,
}

struct Parts<'a> {
    ticker: &'a str,
    target_from: &'a str,
    target_to: &'a str,
    rest: &'a str,
}

struct ActionSplit<'a> {
    action: &'static str,
    company: &'a str,
    tail: &'a str,
}

impl LineParser {
    pub fn new() -> anyhow::Result<Self> {
        let date_re = Regex::new(
            r"(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun)([A-Za-z]{3})(\d{2})(\d{4})(\d{2}):(\d{2})UTC",
        )
        .context("invalid date pattern")?;
        let parts_re = Regex::new(
            r"^([A-Z]+)(\$\d+(?:,\d{3})*\.\d{2})(\$\d+(?:,\d{3})*\.\d{2})(.*)$",
        )
        .context("invalid ticker/targets pattern")?;

        Ok(Self { date_re, parts_re })
    }

    /// Parses one feed line. The returned record is not scored yet.
    pub fn parse(&self, line: &str) -> Result<RatingRecord, ParseError> {
        let date = self.find_date(line)?;
        let data_part = &line[..date.start];
        let parts = self.split_parts(data_part)?;
        let split = split_action(parts.rest)?;
        let (rating_to, rest) = strip_rating_suffix(split.tail)
            .ok_or_else(|| ParseError::RatingToNotFound(split.tail.to_string()))?;
        let (rating_from, brokerage) = strip_rating_suffix(rest)
            .ok_or_else(|| ParseError::RatingFromNotFound(split.tail.to_string()))?;
        let time = parse_date(&date)?;

        Ok(RatingRecord {
            brokerage: space_out(brokerage),
            action: split.action.to_string(),
            company: space_out(split.company),
            ticker: parts.ticker.to_string(),
            rating_from: rating_from.to_string(),
            rating_to: rating_to.to_string(),
            target_from: parts.target_from.to_string(),
            target_to: parts.target_to.to_string(),
            time,
            target_price_change: 0.0,
            score: 0.0,
        })
    }

    fn find_date<'a>(&self, line: &'a str) -> Result<DateToken<'a>, ParseError> {
        let caps = self
            .date_re
            .captures(line)
            .ok_or_else(|| ParseError::DateNotFound(line.to_string()))?;
        let whole = caps
            .get(0)
            .ok_or_else(|| ParseError::DateNotFound(line.to_string()))?;
        let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

        Ok(DateToken {
            start: whole.start(),
            text: whole.as_str(),
            month: group(1),
            day: group(2),
            year: group(3),
            hour: group(4),
            minute: group(5),
        })
    }

    fn split_parts<'a>(&self, data_part: &'a str) -> Result<Parts<'a>, ParseError> {
        let caps = self
            .parts_re
            .captures(data_part)
            .ok_or_else(|| ParseError::TickerTargetsNotMatched(data_part.to_string()))?;
        let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

        Ok(Parts {
            ticker: group(1),
            target_from: group(2),
            target_to: group(3),
            rest: group(4),
        })
    }
}

fn split_action(rest: &str) -> Result<ActionSplit<'_>, ParseError> {
    for &(action, _) in ACTIONS {
        let needle = action.replace(' ', "");
        if let Some(idx) = rest.find(&needle) {
            return Ok(ActionSplit {
                action,
                company: &rest[..idx],
                tail: &rest[idx + needle.len()..],
            });
        }
    }
    Err(ParseError::ActionNotFound(rest.to_string()))
}

/// Strips the first known rating (in vocabulary order) that `s` ends with.
fn strip_rating_suffix(s: &str) -> Option<(&'static str, &str)> {
    RATINGS.iter().find_map(|(rating, _)| {
        let needle = rating.replace(' ', "");
        s.strip_suffix(needle.as_str()).map(|rest| (*rating, rest))
    })
}

fn parse_date(token: &DateToken<'_>) -> Result<NaiveDate, ParseError> {
    let invalid = || ParseError::InvalidDate(token.text.to_string());

    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(token.month))
        .ok_or_else(invalid)?;
    let day: u32 = token.day.parse().map_err(|_| invalid())?;
    let year: i32 = token.year.parse().map_err(|_| invalid())?;
    let hour: u32 = token.hour.parse().map_err(|_| invalid())?;
    let minute: u32 = token.minute.parse().map_err(|_| invalid())?;

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)?;
    NaiveDate::from_ymd_opt(year, month as u32 + 1, day).ok_or_else(invalid)
}

/// Restores word spacing in a name that arrived with its spaces stripped,
/// e.g. `Keefe,Bruyette&Woods` -> `Keefe, Bruyette & Woods`.
///
/// Lossy for names that are not camel-cased; applying it twice is a no-op.
pub fn space_out(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 8);

    for (i, &c) in chars.iter().enumerate() {
        out.push(c);
        let Some(&next) = chars.get(i + 1) else {
            continue;
        };

        let word_char = |ch: char| ch.is_alphabetic() || ch.is_numeric();
        let boundary = ((c.is_lowercase() || c.is_numeric()) && next.is_uppercase())
            || ((word_char(c) || c == ')') && (next == '(' || next == '&'))
            || ((c == ')' || c == '&') && word_char(next))
            || (c == ',' && word_char(next));

        if boundary {
            out.push(' ');
        }
    }

    out
}
