//! Date parsing and date-range chunking.
//!
//! All dates are naive local wall-clock times. Chunk arithmetic therefore
//! never shifts across a daylight-saving transition: a chunk spanning one
//! covers 23 or 25 real hours but the boundaries stay on the same clock
//! times and no interval is dropped.

use crate::error::{EtlError, Result};
use chrono::{
    DateTime, Duration, Local, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;

pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_date(date: &NaiveDateTime) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn serialize_date<S: Serializer>(date: &NaiveDateTime, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_date(date))
}

pub fn serialize_opt_date<S: Serializer>(
    date: &Option<NaiveDateTime>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match date {
        Some(d) => s.serialize_str(&format_date(d)),
        None => s.serialize_none(),
    }
}

pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).unwrap_or_else(|| start_of_day(date))
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A parsed date and whether the input carried a time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDate {
    pub value: NaiveDateTime,
    pub date_only: bool,
}

static RELATIVE_RE: OnceLock<Regex> = OnceLock::new();
static TERM_RE: OnceLock<Regex> = OnceLock::new();

fn relative_re() -> &'static Regex {
    RELATIVE_RE.get_or_init(|| {
        Regex::new(
            r"^(?:(now|today|midnight|yesterday|tomorrow)\s*)?((?:[+-]?\s*\d+\s*[a-z]+\s*)*?)(\s*ago)?$",
        )
        .unwrap()
    })
}

fn term_re() -> &'static Regex {
    TERM_RE.get_or_init(|| Regex::new(r"([+-]?)\s*(\d+)\s*([a-z]+)").unwrap())
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Parse an absolute date (`2020-01-01`, `2020-01-01 12:00:00`, RFC 3339,
/// `@<unix seconds>`) or a relative one (`now`, `yesterday`,
/// `now - 1 day`, `+2 weeks`, `3 days ago`) against `now`.
pub fn parse_date(input: &str, now: NaiveDateTime) -> Result<NaiveDateTime> {
    parse_date_detailed(input, now).map(|p| p.value)
}

pub fn parse_date_detailed(input: &str, now: NaiveDateTime) -> Result<ParsedDate> {
    let trimmed = input.trim();
    let err = || EtlError::DateParse(input.to_string());
    if trimmed.is_empty() {
        return Err(err());
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(value) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(ParsedDate { value, date_only: false });
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(ParsedDate {
                value: start_of_day(date),
                date_only: true,
            });
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ParsedDate {
            value: dt.with_timezone(&Local).naive_local(),
            date_only: false,
        });
    }
    if let Some(epoch) = trimmed.strip_prefix('@') {
        let secs: i64 = epoch.parse().map_err(|_| err())?;
        let dt = Local.timestamp_opt(secs, 0).single().ok_or_else(err)?;
        return Ok(ParsedDate {
            value: dt.naive_local(),
            date_only: false,
        });
    }

    parse_relative(&trimmed.to_ascii_lowercase(), now).ok_or_else(err)
}

fn parse_relative(input: &str, now: NaiveDateTime) -> Option<ParsedDate> {
    let caps = relative_re().captures(input)?;
    let anchor = caps.get(1).map(|m| m.as_str());
    let terms = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let ago = caps.get(3).is_some();
    if anchor.is_none() && terms.trim().is_empty() {
        return None;
    }

    let today = start_of_day(now.date());
    let (mut value, date_only) = match anchor {
        None | Some("now") => (now, false),
        Some("today") | Some("midnight") => (today, true),
        Some("yesterday") => (today - Duration::days(1), true),
        Some("tomorrow") => (today + Duration::days(1), true),
        Some(_) => return None,
    };

    for term in term_re().captures_iter(terms) {
        let mut amount: i64 = term[2].parse().ok()?;
        if &term[1] == "-" {
            amount = -amount;
        }
        if ago {
            amount = -amount;
        }
        value = shift(value, amount, &term[3])?;
    }
    Some(ParsedDate { value, date_only })
}

fn shift(value: NaiveDateTime, amount: i64, unit: &str) -> Option<NaiveDateTime> {
    let unit = unit.strip_suffix('s').unwrap_or(unit);
    let months = |n: i64| -> Option<NaiveDateTime> {
        let m = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
        if n >= 0 {
            value.checked_add_months(m)
        } else {
            value.checked_sub_months(m)
        }
    };
    match unit {
        "sec" | "second" => value.checked_add_signed(Duration::seconds(amount)),
        "min" | "minute" => value.checked_add_signed(Duration::minutes(amount)),
        "hour" => value.checked_add_signed(Duration::hours(amount)),
        "day" => value.checked_add_signed(Duration::days(amount)),
        "week" => value.checked_add_signed(Duration::weeks(amount)),
        "month" => months(amount),
        "year" => months(amount.checked_mul(12)?),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// One sub-interval of the run's date range, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateChunk {
    #[serde(serialize_with = "serialize_date")]
    pub start: NaiveDateTime,
    #[serde(serialize_with = "serialize_date")]
    pub end: NaiveDateTime,
}

impl DateChunk {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        DateChunk { start, end }
    }
}

impl fmt::Display for DateChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", format_date(&self.start), format_date(&self.end))
    }
}

/// Split `[start, end]` into chunks of `chunk_days`, most recent first.
///
/// Walking back from `end`, each chunk starts one second after the end of
/// the chunk before it, except the oldest chunk which starts exactly at
/// `start`. Without a chunk size, or for an empty range, a single chunk
/// covers the whole range.
pub fn generate_chunks(
    start: NaiveDateTime,
    end: NaiveDateTime,
    chunk_days: Option<u32>,
) -> Vec<DateChunk> {
    let Some(days) = chunk_days.filter(|d| *d > 0) else {
        return vec![DateChunk::new(start, end)];
    };
    if end <= start {
        return vec![DateChunk::new(start, end)];
    }

    let step = Duration::days(i64::from(days));
    let mut chunks = Vec::new();
    let mut cursor = end;
    while cursor > start {
        let chunk_end = cursor;
        cursor -= std::cmp::min(cursor - start, step);
        let chunk_start = if cursor == start {
            cursor
        } else {
            cursor + Duration::seconds(1)
        };
        chunks.push(DateChunk::new(chunk_start, chunk_end));
    }
    chunks
}
