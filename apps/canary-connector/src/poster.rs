use crate::batcher::{Batch, Batcher};
use crate::canary::{payload, HistorianApi};
use crate::clock::Clock;
use crate::error::DeliveryError;
use crate::pipeline::PipelineStats;
use crate::queue::{CheckpointStore, QueueStore};
use crate::session::SessionManager;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::value::RawValue;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A drained batch the historian has not acknowledged yet. The encoded body is kept so every
/// retry sends the same bytes.
#[derive(Debug)]
struct PendingBatch {
    id: Uuid,
    samples: usize,
    datasets: Vec<String>,
    tvqs: Box<RawValue>,
    watermark: Option<DateTime<Utc>>,
    attempts: u32,
    drained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub batch_id: Uuid,
    pub samples: usize,
    pub encoded_bytes: usize,
    pub attempts: u32,
    pub drained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to send.
    Idle,
    Delivered { samples: usize },
    Discarded { samples: usize },
    /// The batch stays pending for the next cycle.
    Retained { reason: String },
    /// No token could be obtained; nothing was drained.
    Unauthenticated,
}

/// Removes queue segments older than the retention once the delivered watermark moves.
pub struct Retention {
    pub store: Arc<QueueStore>,
    pub keep: ChronoDuration,
}

pub struct BatchPoster {
    api: Arc<dyn HistorianApi>,
    session: Arc<SessionManager>,
    batcher: Arc<Batcher>,
    checkpoint: Option<Arc<CheckpointStore>>,
    retention: Option<Retention>,
    stats: Arc<PipelineStats>,
    clock: Arc<dyn Clock>,
    max_batch_bytes: usize,
    pending: Mutex<Option<PendingBatch>>,
    pending_view: std::sync::Mutex<Option<PendingSummary>>,
}

impl BatchPoster {
    pub fn new(
        api: Arc<dyn HistorianApi>,
        session: Arc<SessionManager>,
        batcher: Arc<Batcher>,
        stats: Arc<PipelineStats>,
        clock: Arc<dyn Clock>,
        max_batch_bytes: usize,
    ) -> Self {
        Self {
            api,
            session,
            batcher,
            checkpoint: None,
            retention: None,
            stats,
            clock,
            max_batch_bytes,
            pending: Mutex::new(None),
            pending_view: std::sync::Mutex::new(None),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<CheckpointStore>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn pending(&self) -> Option<PendingSummary> {
        self.pending_view.lock().ok().and_then(|view| view.clone())
    }

    /// One post cycle: token, then the pending batch or a freshly drained one, then the POST.
    pub async fn post_cycle(&self) -> CycleOutcome {
        let mut pending = self.pending.lock().await;

        let tokens = match self.session.get_valid_token().await {
            Ok(tokens) => tokens,
            Err(err) => {
                self.stats.record_error(err.to_string());
                return CycleOutcome::Unauthenticated;
            }
        };

        if pending.is_none() {
            let batch = self.batcher.drain(self.max_batch_bytes);
            if batch.is_empty() {
                if let Some(watermark) = batch.watermark {
                    self.commit(watermark);
                }
                return CycleOutcome::Idle;
            }
            match self.prepare(batch) {
                Some(prepared) => *pending = Some(prepared),
                None => return CycleOutcome::Idle,
            }
            self.publish_pending(pending.as_ref());
        }

        let Some(batch) = pending.as_mut() else {
            return CycleOutcome::Idle;
        };
        batch.attempts += 1;
        if batch.attempts > 1 {
            self.stats.record_retry();
        }

        let result = self
            .api
            .store_data(&tokens, &batch.tvqs)
            .await
            .map_err(DeliveryError::from);

        let outcome = match result {
            Ok(()) => {
                let samples = batch.samples;
                tracing::debug!(batch_id = %batch.id, samples, attempts = batch.attempts, "batch accepted");
                self.session.touch().await;
                self.stats.record_delivered(samples, self.clock.now());
                self.finish(pending.take());
                CycleOutcome::Delivered { samples }
            }
            Err(DeliveryError::Permanent { reasons }) => {
                let samples = batch.samples;
                tracing::error!(
                    batch_id = %batch.id,
                    samples,
                    datasets = ?batch.datasets,
                    reasons = ?reasons,
                    "historian rejected batch; discarding"
                );
                self.stats.record_discarded(samples);
                self.stats.record_error(reasons.join("; "));
                self.finish(pending.take());
                CycleOutcome::Discarded { samples }
            }
            Err(DeliveryError::Auth(reason)) => {
                tracing::warn!(batch_id = %batch.id, reason = %reason, "session rejected during post; batch kept");
                self.session.invalidate().await;
                self.stats.record_error(format!("auth: {reason}"));
                CycleOutcome::Retained { reason }
            }
            Err(DeliveryError::Transient(reason)) => {
                tracing::warn!(
                    batch_id = %batch.id,
                    attempts = batch.attempts,
                    reason = %reason,
                    "batch delivery failed; retrying next cycle"
                );
                self.stats.record_error(reason.clone());
                CycleOutcome::Retained { reason }
            }
        };
        self.publish_pending(pending.as_ref());
        outcome
    }

    /// Last delivery attempt at shutdown, then token release.
    pub async fn shutdown(&self) {
        let outcome = self.post_cycle().await;
        tracing::info!(?outcome, "final post cycle");
        if let Some(pending) = self.pending() {
            tracing::warn!(
                batch_id = %pending.batch_id,
                samples = pending.samples,
                "undelivered batch left at shutdown; it is re-read from the queue on restart"
            );
        }
        self.session.revoke().await;
    }

    fn prepare(&self, batch: Batch) -> Option<PendingBatch> {
        let datasets = payload::datasets(&batch.samples);
        match payload::encode_tvqs(&batch.samples) {
            Ok(tvqs) => Some(PendingBatch {
                id: Uuid::new_v4(),
                samples: batch.samples.len(),
                datasets,
                tvqs,
                watermark: batch.watermark,
                attempts: 0,
                drained_at: self.clock.now(),
            }),
            Err(err) => {
                tracing::error!(
                    samples = batch.samples.len(),
                    datasets = ?datasets,
                    error = %err,
                    "failed to encode batch; discarding"
                );
                self.stats.record_discarded(batch.samples.len());
                if let Some(watermark) = batch.watermark {
                    self.commit(watermark);
                }
                None
            }
        }
    }

    fn finish(&self, done: Option<PendingBatch>) {
        if let Some(watermark) = done.and_then(|batch| batch.watermark) {
            self.commit(watermark);
        }
    }

    fn commit(&self, watermark: DateTime<Utc>) {
        let Some(checkpoint) = self.checkpoint.as_ref() else {
            return;
        };
        match checkpoint.persist(watermark) {
            Ok(true) => {
                tracing::trace!(%watermark, "delivered watermark advanced");
                if let Some(retention) = self.retention.as_ref() {
                    if let Err(err) = retention.store.prune_before(watermark - retention.keep) {
                        tracing::warn!(error = %err, "failed to prune local queue");
                    }
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed to persist delivered watermark");
                self.stats.record_error(format!("checkpoint: {err:#}"));
            }
        }
    }

    fn publish_pending(&self, pending: Option<&PendingBatch>) {
        let summary = pending.map(|batch| PendingSummary {
            batch_id: batch.id,
            samples: batch.samples,
            encoded_bytes: batch.tvqs.get().len(),
            attempts: batch.attempts,
            drained_at: batch.drained_at,
        });
        if let Ok(mut view) = self.pending_view.lock() {
            *view = summary;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::{ApiError, SessionRequest};
    use crate::config::ConnectorConfig;
    use crate::session::Credentials;
    use crate::telemetry::millis_to_dt;
    use crate::test_support::{sample_at, FakeHistorian, ManualClock};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        api: Arc<FakeHistorian>,
        clock: Arc<ManualClock>,
        batcher: Arc<Batcher>,
        stats: Arc<PipelineStats>,
        poster: BatchPoster,
        checkpoint: Arc<CheckpointStore>,
        _dir: TempDir,
    }

    fn harness(api: FakeHistorian) -> Harness {
        let api = Arc::new(api);
        let clock = Arc::new(ManualClock::new(millis_to_dt(0)));
        let session = Arc::new(SessionManager::new(
            api.clone(),
            clock.clone(),
            Credentials {
                username: "edge".into(),
                password: "secret".into(),
            },
            SessionRequest::from_config(&ConnectorConfig::default()),
            Duration::from_secs(300),
            Duration::from_secs(8),
        ));
        let batcher = Arc::new(Batcher::new(1000));
        let stats = Arc::new(PipelineStats::new());
        let dir = TempDir::new().unwrap();
        let checkpoint = Arc::new(CheckpointStore::new(dir.path().join("checkpoint.json")));
        let poster = BatchPoster::new(
            api.clone(),
            session,
            batcher.clone(),
            stats.clone(),
            clock.clone(),
            8 << 20,
        )
        .with_checkpoint(checkpoint.clone());
        Harness {
            api,
            clock,
            batcher,
            stats,
            poster,
            checkpoint,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn empty_buffer_is_a_no_op_send() {
        let h = harness(FakeHistorian::default());
        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Idle);
        assert!(h.api.store_attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_retries_identical_bytes_once_accepted() {
        let h = harness(FakeHistorian::default());
        h.batcher.append_window(
            vec![sample_at("ds", "a", 1_000, 1.0), sample_at("ds", "b", 2_000, 2.0)],
            millis_to_dt(60_000),
        );
        h.api.fail_next_store(ApiError::Transport("timed out".into()));

        let first = h.poster.post_cycle().await;
        assert!(matches!(first, CycleOutcome::Retained { .. }));
        assert_eq!(h.poster.pending().unwrap().attempts, 1);
        assert_eq!(h.checkpoint.watermark(), None);

        h.batcher.append(vec![sample_at("ds", "c", 3_000, 3.0)]);
        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Delivered { samples: 2 });
        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Delivered { samples: 1 });

        let attempts = h.api.store_attempts.lock().unwrap();
        assert_eq!(attempts[0], attempts[1]);
        assert_eq!(h.api.accepted.lock().unwrap().len(), 2);
        assert_eq!(h.api.accepted_sample_count(), 3);
        assert_eq!(h.checkpoint.watermark(), Some(millis_to_dt(60_000)));
        assert_eq!(h.stats.snapshot().post_retries, 1);
    }

    #[tokio::test]
    async fn status_timestamps_follow_the_injected_clock() {
        let h = harness(FakeHistorian::default());
        h.clock.set(millis_to_dt(42_000));
        h.batcher.append(vec![sample_at("ds", "a", 1_000, 1.0)]);
        h.api.fail_next_store(ApiError::Transport("timed out".into()));

        assert!(matches!(h.poster.post_cycle().await, CycleOutcome::Retained { .. }));
        assert_eq!(h.poster.pending().unwrap().drained_at, millis_to_dt(42_000));

        h.clock.set(millis_to_dt(45_000));
        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Delivered { samples: 1 });
        assert_eq!(h.stats.snapshot().last_post_at, Some(millis_to_dt(45_000)));
    }

    #[tokio::test]
    async fn auth_rejection_keeps_batch_and_reauthenticates() {
        let h = harness(FakeHistorian::default());
        h.batcher.append(vec![sample_at("ds", "a", 1_000, 1.0)]);
        h.api.fail_next_store(ApiError::BadTokens("BadSessionId".into()));

        assert!(matches!(h.poster.post_cycle().await, CycleOutcome::Retained { .. }));
        assert!(h.poster.pending().is_some());
        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Delivered { samples: 1 });
        assert_eq!(h.api.session_token_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_outage_drains_nothing() {
        let h = harness(FakeHistorian::default());
        h.batcher.append(vec![sample_at("ds", "a", 1_000, 1.0)]);
        h.api.auth_down.store(true, Ordering::SeqCst);

        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Unauthenticated);
        assert_eq!(h.batcher.len(), 1);
        assert!(h.poster.pending().is_none());

        h.api.auth_down.store(false, Ordering::SeqCst);
        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Delivered { samples: 1 });
    }

    #[tokio::test]
    async fn permanent_rejection_discards_and_advances_watermark() {
        let h = harness(FakeHistorian::with_unknown_dataset("Unknown"));
        h.batcher.append_window(vec![sample_at("Unknown", "a", 1_000, 1.0)], millis_to_dt(60_000));

        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Discarded { samples: 1 });
        assert!(h.poster.pending().is_none());
        assert_eq!(h.checkpoint.watermark(), Some(millis_to_dt(60_000)));
        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.batches_discarded, 1);
        assert!(snapshot.last_error.unwrap().contains("Unknown"));
    }

    #[tokio::test]
    async fn sample_less_window_still_advances_watermark() {
        let h = harness(FakeHistorian::default());
        h.batcher.append_window(Vec::new(), millis_to_dt(120_000));
        assert_eq!(h.poster.post_cycle().await, CycleOutcome::Idle);
        assert_eq!(h.checkpoint.watermark(), Some(millis_to_dt(120_000)));
    }

    #[tokio::test]
    async fn shutdown_flushes_then_revokes() {
        let h = harness(FakeHistorian::default());
        h.batcher.append(vec![sample_at("ds", "a", 1_000, 1.0)]);
        h.poster.shutdown().await;
        assert_eq!(h.api.accepted.lock().unwrap().len(), 1);
        assert_eq!(h.api.revoked_sessions.load(Ordering::SeqCst), 1);
    }
}
