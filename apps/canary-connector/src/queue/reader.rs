use super::{Cursor, QueueCapabilities, QueueSource};
use crate::error::SourceReadError;
use crate::telemetry::{PollWindow, TagSample};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Pulls consecutive, non-overlapping windows out of the queue. Sole owner of the [`Cursor`].
pub struct QueueReader {
    source: Arc<dyn QueueSource>,
    cursor: Cursor,
    poll_size: ChronoDuration,
    settle: ChronoDuration,
    capabilities: QueueCapabilities,
}

impl QueueReader {
    pub fn new(
        source: Arc<dyn QueueSource>,
        start: DateTime<Utc>,
        poll_size: ChronoDuration,
        capabilities: QueueCapabilities,
    ) -> Self {
        Self {
            source,
            cursor: Cursor::new(start),
            poll_size,
            settle: ChronoDuration::zero(),
            capabilities,
        }
    }

    /// Keeps windows `settle` behind real time so producers that write slightly late still land
    /// ahead of the cursor.
    pub fn with_settle(mut self, settle: ChronoDuration) -> Self {
        self.settle = settle.max(ChronoDuration::zero());
        self
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn capabilities(&self) -> QueueCapabilities {
        self.capabilities
    }

    /// `[cursor, min(cursor + poll size, now - settle))`, or `None` once the cursor has caught up.
    pub fn next_window(&self, now: DateTime<Utc>) -> Option<PollWindow> {
        let start = self.cursor.last_read_time;
        let end = (start + self.poll_size).min(now - self.settle);
        if end <= start {
            return None;
        }
        Some(PollWindow::new(start, end))
    }

    /// Reads `window` and advances the cursor to its end. On error the cursor stays put so the
    /// same window is read again.
    pub fn poll(&mut self, window: PollWindow) -> Result<(Vec<TagSample>, Cursor), SourceReadError> {
        let Some(next) = self.cursor.advanced_past(&window) else {
            return Err(SourceReadError::OutOfOrder {
                window,
                cursor: self.cursor.last_read_time,
            });
        };
        let samples = self.source.read_window(&window, self.capabilities)?;
        self.cursor = next;
        tracing::debug!(%window, count = samples.len(), "read queue window");
        Ok((samples, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{millis_to_dt, Quality, TagValue};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct ScriptedSource {
        samples: Vec<TagSample>,
        failing: AtomicBool,
        reads: Mutex<Vec<PollWindow>>,
    }

    impl QueueSource for ScriptedSource {
        fn read_window(
            &self,
            window: &PollWindow,
            _capabilities: QueueCapabilities,
        ) -> Result<Vec<TagSample>, SourceReadError> {
            self.reads.lock().unwrap().push(*window);
            if self.failing.load(Ordering::SeqCst) {
                return Err(SourceReadError::Unavailable {
                    window: *window,
                    reason: "queue locked".into(),
                });
            }
            Ok(self
                .samples
                .iter()
                .filter(|s| window.contains(s.timestamp))
                .cloned()
                .collect())
        }
    }

    fn source(timestamps_ms: &[i64]) -> Arc<ScriptedSource> {
        Arc::new(ScriptedSource {
            samples: timestamps_ms
                .iter()
                .map(|ts| TagSample {
                    tag_id: format!("t{ts}"),
                    timestamp: millis_to_dt(*ts),
                    value: TagValue::Integer(*ts),
                    quality: Quality::Good,
                    dataset: "ds".into(),
                })
                .collect(),
            failing: AtomicBool::new(false),
            reads: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn windows_are_clamped_to_now() {
        let reader = QueueReader::new(
            source(&[]),
            millis_to_dt(0),
            ChronoDuration::minutes(5),
            QueueCapabilities::default(),
        );
        let full = reader.next_window(millis_to_dt(600_000)).unwrap();
        assert_eq!(full.end, millis_to_dt(300_000));

        let partial = reader.next_window(millis_to_dt(90_000)).unwrap();
        assert_eq!(partial.end, millis_to_dt(90_000));

        assert!(reader.next_window(millis_to_dt(0)).is_none());
    }

    #[test]
    fn settle_keeps_windows_behind_now() {
        let reader = QueueReader::new(
            source(&[]),
            millis_to_dt(0),
            ChronoDuration::minutes(5),
            QueueCapabilities::default(),
        )
        .with_settle(ChronoDuration::seconds(5));
        assert_eq!(
            reader.next_window(millis_to_dt(30_000)),
            Some(PollWindow::new(millis_to_dt(0), millis_to_dt(25_000)))
        );
        assert!(reader.next_window(millis_to_dt(5_000)).is_none());
        assert_eq!(
            reader.next_window(millis_to_dt(900_000)).unwrap().end,
            millis_to_dt(300_000)
        );
    }

    #[test]
    fn failed_read_keeps_cursor_and_retries_same_window() {
        let src = source(&[1_000, 2_000]);
        let mut reader = QueueReader::new(
            src.clone(),
            millis_to_dt(0),
            ChronoDuration::minutes(5),
            QueueCapabilities::default(),
        );
        let now = millis_to_dt(10_000);

        src.failing.store(true, Ordering::SeqCst);
        let window = reader.next_window(now).unwrap();
        assert!(reader.poll(window).is_err());
        assert_eq!(reader.cursor().last_read_time, millis_to_dt(0));

        src.failing.store(false, Ordering::SeqCst);
        let retry = reader.next_window(now).unwrap();
        assert_eq!(retry, window);
        let (samples, cursor) = reader.poll(retry).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(cursor.last_read_time, now);
    }

    #[test]
    fn rejects_window_not_starting_at_cursor() {
        let src = source(&[]);
        let mut reader = QueueReader::new(
            src.clone(),
            millis_to_dt(0),
            ChronoDuration::minutes(5),
            QueueCapabilities::default(),
        );
        let err = reader
            .poll(PollWindow::new(millis_to_dt(5_000), millis_to_dt(6_000)))
            .unwrap_err();
        assert!(matches!(err, SourceReadError::OutOfOrder { .. }));
        assert!(src.reads.lock().unwrap().is_empty());
    }

    #[test]
    fn successive_polls_partition_time_without_gaps() {
        let timestamps: Vec<i64> = (0..40).map(|i| i * 45_000).collect();
        let src = source(&timestamps);
        let mut reader = QueueReader::new(
            src.clone(),
            millis_to_dt(0),
            ChronoDuration::minutes(5),
            QueueCapabilities::default(),
        );

        let mut seen = Vec::new();
        let mut now_ms = 0;
        for step in 0..30 {
            now_ms += 37_000 + (step % 4) * 61_000;
            if let Some(window) = reader.next_window(millis_to_dt(now_ms)) {
                let (samples, _) = reader.poll(window).unwrap();
                seen.extend(samples.into_iter().map(|s| s.timestamp.timestamp_millis()));
            }
        }

        let reads = src.reads.lock().unwrap();
        assert_eq!(reads[0].start, millis_to_dt(0));
        for pair in reads.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        let expected: Vec<i64> = timestamps
            .into_iter()
            .filter(|ts| *ts < reader.cursor().last_read_time.timestamp_millis())
            .collect();
        assert_eq!(seen, expected);
    }
}
