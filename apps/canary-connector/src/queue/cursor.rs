use crate::telemetry::PollWindow;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Read position in the device queue. Everything before `last_read_time` has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub last_read_time: DateTime<Utc>,
}

impl Cursor {
    pub fn new(last_read_time: DateTime<Utc>) -> Self {
        Self { last_read_time }
    }

    pub fn lag_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_read_time).num_milliseconds() as f64 / 1000.0
    }

    /// Cursor after `window` was read. `None` when the window does not continue from here.
    pub fn advanced_past(&self, window: &PollWindow) -> Option<Cursor> {
        if window.start != self.last_read_time || window.end < window.start {
            return None;
        }
        Some(Cursor::new(window.end))
    }
}
