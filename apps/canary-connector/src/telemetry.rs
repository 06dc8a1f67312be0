use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const TVQ_QUALITY_GOOD: u16 = 192;
const TVQ_QUALITY_UNCERTAIN: u16 = 64;
const TVQ_QUALITY_BAD: u16 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    pub fn is_text(&self) -> bool {
        matches!(self, TagValue::Text(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    /// OPC-style quality code expected in a Canary TVQ triple.
    pub fn tvq_code(self) -> u16 {
        match self {
            Quality::Good => TVQ_QUALITY_GOOD,
            Quality::Uncertain => TVQ_QUALITY_UNCERTAIN,
            Quality::Bad => TVQ_QUALITY_BAD,
        }
    }
}

/// One recorded tag value. Immutable once read from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSample {
    pub tag_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: TagValue,
    pub quality: Quality,
    pub dataset: String,
}

impl TagSample {
    /// Fully qualified historian tag name, `<dataset>.<tag>`.
    pub fn tvq_name(&self) -> String {
        format!("{}.{}", self.dataset, self.tag_id)
    }

    pub fn timestamp_iso8601(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Half-open interval `[start, end)` of queue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PollWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn width(&self) -> ChronoDuration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for PollWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

pub fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
