use crate::clock::Clock;
use crate::config::{GeneralConfig, BEHIND_CHECK_DISABLED};
use crate::queue::Cursor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LagState {
    Ok,
    Warning,
    Critical,
    /// Both behind-time checks are configured off.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagThresholds {
    pub warn_seconds: Option<i64>,
    pub max_seconds: Option<i64>,
}

impl LagThresholds {
    pub fn from_minutes(warn_mins: i64, max_mins: i64) -> Self {
        let to_seconds = |mins: i64| (mins != BEHIND_CHECK_DISABLED).then(|| mins.max(0) * 60);
        Self {
            warn_seconds: to_seconds(warn_mins),
            max_seconds: to_seconds(max_mins),
        }
    }

    pub fn from_config(general: &GeneralConfig) -> Self {
        Self::from_minutes(
            general.queue_data_poll_warn_behind_time_mins,
            general.queue_data_poll_max_behind_time_mins,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LagReport {
    pub state: LagState,
    pub lag_seconds: f64,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LagMemory {
    reset_at: Option<DateTime<Utc>>,
    last: Option<LagReport>,
}

/// Measures how far the cursor trails real time. Every evaluation starts from scratch.
pub struct LagMonitor {
    clock: Arc<dyn Clock>,
    thresholds: LagThresholds,
    memory: Mutex<LagMemory>,
}

impl LagMonitor {
    pub fn new(clock: Arc<dyn Clock>, thresholds: LagThresholds) -> Self {
        Self {
            clock,
            thresholds,
            memory: Mutex::new(LagMemory::default()),
        }
    }

    pub fn thresholds(&self) -> LagThresholds {
        self.thresholds
    }

    /// Restarts lag accounting at the current time. The cursor itself is not moved.
    pub fn reset(&self) {
        let now = self.clock.now();
        if let Ok(mut memory) = self.memory.lock() {
            memory.reset_at = Some(now);
        }
        tracing::info!(reset_at = %now, "lag accounting reset by operator trigger");
    }

    pub fn lag_seconds(&self, cursor: &Cursor) -> f64 {
        let reset_at = self.memory.lock().ok().and_then(|memory| memory.reset_at);
        let reference = match reset_at {
            Some(reset_at) if reset_at > cursor.last_read_time => Cursor::new(reset_at),
            _ => *cursor,
        };
        reference.lag_seconds(self.clock.now()).max(0.0)
    }

    pub fn evaluate(&self, cursor: &Cursor) -> LagState {
        self.classify(self.lag_seconds(cursor))
    }

    /// Evaluates, remembers the result for status reporting and logs state changes.
    pub fn observe(&self, cursor: &Cursor) -> LagReport {
        let lag_seconds = self.lag_seconds(cursor);
        let report = LagReport {
            state: self.classify(lag_seconds),
            lag_seconds,
            evaluated_at: self.clock.now(),
        };
        let previous = match self.memory.lock() {
            Ok(mut memory) => memory.last.replace(report).map(|last| last.state),
            Err(_) => None,
        };
        if previous != Some(report.state) {
            log_transition(previous, &report);
        }
        report
    }

    pub fn last_report(&self) -> Option<LagReport> {
        self.memory.lock().ok().and_then(|memory| memory.last)
    }

    fn classify(&self, lag_seconds: f64) -> LagState {
        let LagThresholds {
            warn_seconds,
            max_seconds,
        } = self.thresholds;
        if warn_seconds.is_none() && max_seconds.is_none() {
            return LagState::Disabled;
        }
        if max_seconds.is_some_and(|max| lag_seconds > max as f64) {
            return LagState::Critical;
        }
        if warn_seconds.is_some_and(|warn| lag_seconds > warn as f64) {
            return LagState::Warning;
        }
        LagState::Ok
    }
}

fn log_transition(previous: Option<LagState>, report: &LagReport) {
    match report.state {
        LagState::Critical => tracing::error!(
            lag_seconds = report.lag_seconds,
            ?previous,
            "queue polling is critically behind"
        ),
        LagState::Warning => tracing::warn!(
            lag_seconds = report.lag_seconds,
            ?previous,
            "queue polling is falling behind"
        ),
        LagState::Ok if previous.is_some() => tracing::info!(
            lag_seconds = report.lag_seconds,
            ?previous,
            "queue polling caught up"
        ),
        LagState::Ok => {}
        LagState::Disabled => tracing::debug!("behind-time checks disabled"),
    }
}
