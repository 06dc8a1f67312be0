use crate::batcher::Batcher;
use crate::canary::{HistorianApi, SessionRequest};
use crate::clock::Clock;
use crate::config::ConnectorConfig;
use crate::diagnostics::DiagnosticPublisher;
use crate::lag::{LagMonitor, LagReport, LagState, LagThresholds};
use crate::poster::{BatchPoster, PendingSummary, Retention};
use crate::queue::{CheckpointStore, Cursor, QueueCapabilities, QueueReader, QueueStore};
use crate::session::{Credentials, SessionManager, SessionStatus};
use crate::telemetry::{millis_to_dt, PollWindow};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;


/// Pause of the zero-interval poll loop once it has caught up or cannot read.
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct PipelineStats {
    polls_ok: AtomicU64,
    polls_failed: AtomicU64,
    polls_throttled: AtomicU64,
    samples_read: AtomicU64,
    batches_posted: AtomicU64,
    samples_posted: AtomicU64,
    batches_discarded: AtomicU64,
    samples_discarded: AtomicU64,
    post_retries: AtomicU64,
    cursor_unix_ms: AtomicI64,
    last_poll_unix_ms: AtomicI64,
    last_post_unix_ms: AtomicI64,
    throttled: AtomicBool,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub polls_throttled: u64,
    pub samples_read: u64,
    pub batches_posted: u64,
    pub samples_posted: u64,
    pub batches_discarded: u64,
    pub samples_discarded: u64,
    pub post_retries: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_post_at: Option<DateTime<Utc>>,
    pub throttled: bool,
    pub last_error: Option<String>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            polls_ok: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            polls_throttled: AtomicU64::new(0),
            samples_read: AtomicU64::new(0),
            batches_posted: AtomicU64::new(0),
            samples_posted: AtomicU64::new(0),
            batches_discarded: AtomicU64::new(0),
            samples_discarded: AtomicU64::new(0),
            post_retries: AtomicU64::new(0),
            cursor_unix_ms: AtomicI64::new(i64::MIN),
            last_poll_unix_ms: AtomicI64::new(i64::MIN),
            last_post_unix_ms: AtomicI64::new(i64::MIN),
            throttled: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_poll(&self, samples: usize, cursor: Cursor, at: DateTime<Utc>) {
        self.polls_ok.fetch_add(1, Ordering::Relaxed);
        self.samples_read.fetch_add(samples as u64, Ordering::Relaxed);
        self.cursor_unix_ms
            .store(cursor.last_read_time.timestamp_millis(), Ordering::Relaxed);
        self.last_poll_unix_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self, err: impl Into<String>) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    /// Returns whether throttling just started.
    pub fn set_throttled(&self, throttled: bool) -> bool {
        if throttled {
            self.polls_throttled.fetch_add(1, Ordering::Relaxed);
        }
        let was = self.throttled.swap(throttled, Ordering::Relaxed);
        throttled && !was
    }

    pub fn record_delivered(&self, samples: usize, at: DateTime<Utc>) {
        self.batches_posted.fetch_add(1, Ordering::Relaxed);
        self.samples_posted.fetch_add(samples as u64, Ordering::Relaxed);
        self.last_post_unix_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_discarded(&self, samples: usize) {
        self.batches_discarded.fetch_add(1, Ordering::Relaxed);
        self.samples_discarded.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.post_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        unix_ms(self.cursor_unix_ms.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            polls_ok: self.polls_ok.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            polls_throttled: self.polls_throttled.load(Ordering::Relaxed),
            samples_read: self.samples_read.load(Ordering::Relaxed),
            batches_posted: self.batches_posted.load(Ordering::Relaxed),
            samples_posted: self.samples_posted.load(Ordering::Relaxed),
            batches_discarded: self.batches_discarded.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            post_retries: self.post_retries.load(Ordering::Relaxed),
            last_poll_at: unix_ms(self.last_poll_unix_ms.load(Ordering::Relaxed)),
            last_post_at: unix_ms(self.last_post_unix_ms.load(Ordering::Relaxed)),
            throttled: self.throttled.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

fn unix_ms(ms: i64) -> Option<DateTime<Utc>> {
    (ms != i64::MIN).then(|| millis_to_dt(ms))
}

/// Runtime switches an operator can flip on a running connector.
#[derive(Debug, Default)]
pub struct OperatorControls {
    polling_disabled: AtomicBool,
    shutdown: CancellationToken,
}

impl OperatorControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn polling_disabled(&self) -> bool {
        self.polling_disabled.load(Ordering::SeqCst)
    }

    /// Pauses or resumes queue reads. Posting of already buffered data goes on either way.
    pub fn set_polling_disabled(&self, disabled: bool) {
        let was = self.polling_disabled.swap(disabled, Ordering::SeqCst);
        if was != disabled {
            if disabled {
                tracing::warn!("queue polling disabled by operator");
            } else {
                tracing::info!("queue polling re-enabled by operator");
            }
        }
    }

    /// Token cancelled when a shutdown is requested. Services started with it stop cleanly.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::warn!("connector shutdown requested by operator");
        }
        self.shutdown.cancel();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Read {
        window: PollWindow,
        samples: usize,
        /// The window had the full configured width, so more data may be waiting.
        full: bool,
    },
    CaughtUp,
    Throttled,
    /// Polling is disabled by the operator.
    Paused,
    Failed(String),
}

/// Poll loop: reads windows into the batcher, then updates lag and diagnostics.
pub struct PollService {
    reader: QueueReader,
    batcher: Arc<Batcher>,
    lag: Arc<LagMonitor>,
    diagnostics: Arc<DiagnosticPublisher>,
    stats: Arc<PipelineStats>,
    controls: Arc<OperatorControls>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    poll_size: chrono::Duration,
    max_buffered_samples: usize,
}

impl PollService {
    pub fn cursor(&self) -> Cursor {
        self.reader.cursor()
    }

    /// One poll attempt. Blocking: it reads the queue from disk.
    pub fn poll_cycle(&mut self) -> PollOutcome {
        let now = self.clock.now();
        let outcome = if self.controls.polling_disabled() {
            PollOutcome::Paused
        } else if self.batcher.len() >= self.max_buffered_samples {
            if self.stats.set_throttled(true) {
                tracing::warn!(
                    buffered = self.batcher.len(),
                    limit = self.max_buffered_samples,
                    "delivery is behind; pausing queue reads"
                );
            }
            PollOutcome::Throttled
        } else {
            if self.stats.throttled.load(Ordering::Relaxed) {
                tracing::info!("delivery caught up; resuming queue reads");
            }
            self.stats.set_throttled(false);
            match self.reader.next_window(now) {
                None => PollOutcome::CaughtUp,
                Some(window) => match self.reader.poll(window) {
                    Ok((samples, cursor)) => {
                        let count = samples.len();
                        self.batcher.append_window(samples, cursor.last_read_time);
                        self.stats.record_poll(count, cursor, now);
                        PollOutcome::Read {
                            window,
                            samples: count,
                            full: window.width() >= self.poll_size,
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "queue read failed; window will be retried");
                        self.stats.record_poll_failure(err.to_string());
                        PollOutcome::Failed(err.to_string())
                    }
                },
            }
        };

        let reset_fired = self.diagnostics.take_reset();
        if reset_fired {
            self.lag.reset();
        }
        let report = self.lag.observe(&self.reader.cursor());
        if let Err(err) = self.diagnostics.publish(report.lag_seconds, reset_fired) {
            tracing::warn!(error = %err, "failed to publish diagnostic tags");
        }
        outcome
    }

    fn delay_after(&self, outcome: &PollOutcome) -> Duration {
        if !self.interval.is_zero() {
            return self.interval;
        }
        match outcome {
            PollOutcome::Read { full: true, .. } => Duration::ZERO,
            _ => IDLE_BACKOFF,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut service = self;
            tracing::info!(
                cursor = %service.cursor().last_read_time,
                interval_ms = service.interval.as_millis() as u64,
                "queue poll loop started"
            );
            loop {
                let joined = tokio::task::spawn_blocking(move || {
                    let outcome = service.poll_cycle();
                    (service, outcome)
                })
                .await;
                let (returned, outcome) = match joined {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::error!(error = %err, "queue poll task failed; poll loop stopped");
                        return;
                    }
                };
                service = returned;

                let delay = service.delay_after(&outcome);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tracing::info!(cursor = %service.cursor().last_read_time, "queue poll loop stopped");
        })
    }
}

/// Post loop: one delivery cycle per `QueueDataPostRateMillis`.
pub struct PostService {
    poster: Arc<BatchPoster>,
    rate: Duration,
}

impl PostService {
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let poster = self.poster;
        let rate = self.rate;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rate);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = poster.post_cycle().await;
                        tracing::trace!(?outcome, "post cycle");
                    }
                }
            }
            poster.shutdown().await;
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub client_id: String,
    pub lag: Option<LagReport>,
    pub cursor: Option<DateTime<Utc>>,
    pub delivered_through: Option<DateTime<Utc>>,
    pub buffered_samples: usize,
    pub buffered_bytes: usize,
    pub pending_batch: Option<PendingSummary>,
    pub session: SessionStatus,
    pub capabilities: QueueCapabilities,
    pub polling_disabled: bool,
    pub shutdown_requested: bool,
    pub diagnostics_enabled: bool,
    pub heartbeat: u64,
    pub stats: StatsSnapshot,
}

/// Shared view of a running pipeline for the status surface.
#[derive(Clone)]
pub struct PipelineHandle {
    pub store: Arc<QueueStore>,
    pub batcher: Arc<Batcher>,
    pub lag: Arc<LagMonitor>,
    pub diagnostics: Arc<DiagnosticPublisher>,
    pub session: Arc<SessionManager>,
    pub poster: Arc<BatchPoster>,
    pub checkpoint: Arc<CheckpointStore>,
    pub stats: Arc<PipelineStats>,
    pub controls: Arc<OperatorControls>,
    pub client_id: String,
    pub capabilities: QueueCapabilities,
}

impl PipelineHandle {
    pub fn status(&self) -> StatusReport {
        StatusReport {
            client_id: self.client_id.clone(),
            lag: self.lag.last_report(),
            cursor: self.stats.cursor(),
            delivered_through: self.checkpoint.watermark(),
            buffered_samples: self.batcher.len(),
            buffered_bytes: self.batcher.buffered_bytes(),
            pending_batch: self.poster.pending(),
            session: self.session.status(),
            capabilities: self.capabilities,
            polling_disabled: self.controls.polling_disabled(),
            shutdown_requested: self.controls.shutdown_requested(),
            diagnostics_enabled: self.diagnostics.enabled(),
            heartbeat: self.diagnostics.heartbeat(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn lag_state(&self) -> Option<LagState> {
        self.lag.last_report().map(|report| report.state)
    }
}

pub struct Pipeline {
    handle: PipelineHandle,
    poll: PollService,
    post: PostService,
}

impl Pipeline {
    pub fn build(
        config: &ConnectorConfig,
        api: Arc<dyn HistorianApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let general = &config.general;
        let client_id = config.canary.api.api_client_id.clone();
        let capabilities = QueueCapabilities::from_config(general);

        let store = Arc::new(
            QueueStore::open(&config.local.queue_directory, config.segment_roll())
                .context("failed to open local queue")?,
        );
        let checkpoint = Arc::new(CheckpointStore::new(&config.local.checkpoint_path));
        let start = match checkpoint.load() {
            Ok(Some(watermark)) => {
                tracing::info!(%watermark, "resuming from delivered watermark");
                watermark
            }
            Ok(None) => {
                let start = clock.now() - config.initial_lookback();
                tracing::info!(%start, "no checkpoint; starting from configured lookback");
                start
            }
            Err(err) => {
                let start = clock.now() - config.initial_lookback();
                tracing::warn!(error = %err, %start, "unreadable checkpoint; starting from configured lookback");
                start
            }
        };

        store.seal_before(start);

        let stats = Arc::new(PipelineStats::new());
        let controls = Arc::new(OperatorControls::new());
        let batcher = Arc::new(Batcher::new(config.local.max_samples_per_post));
        let lag = Arc::new(LagMonitor::new(clock.clone(), LagThresholds::from_config(general)));
        let diagnostics = Arc::new(DiagnosticPublisher::new(
            store.clone(),
            clock.clone(),
            client_id.clone(),
            general.queue_enable_diagnostic_tags,
        ));
        let session = Arc::new(SessionManager::new(
            api.clone(),
            clock.clone(),
            Credentials {
                username: config.canary.auth.user_name.clone(),
                password: config.canary.auth.user_password.clone(),
            },
            SessionRequest::from_config(config),
            config.session_timeout(),
            config.session_renew_margin(),
        ));
        let poster = Arc::new(
            BatchPoster::new(
                api,
                session.clone(),
                batcher.clone(),
                stats.clone(),
                clock.clone(),
                config.max_batch_bytes(),
            )
            .with_checkpoint(checkpoint.clone())
            .with_retention(Retention {
                store: store.clone(),
                keep: config.queue_retention(),
            }),
        );

        let reader = QueueReader::new(store.clone(), start, config.poll_size(), capabilities)
            .with_settle(config.queue_settle());
        let poll = PollService {
            reader,
            batcher: batcher.clone(),
            lag: lag.clone(),
            diagnostics: diagnostics.clone(),
            stats: stats.clone(),
            controls: controls.clone(),
            clock,
            interval: config.poll_interval(),
            poll_size: config.poll_size(),
            max_buffered_samples: config.local.max_buffered_samples.max(1),
        };
        let post = PostService {
            poster: poster.clone(),
            rate: config.post_rate(),
        };

        Ok(Self {
            handle: PipelineHandle {
                store,
                batcher,
                lag,
                diagnostics,
                session,
                poster,
                checkpoint,
                stats,
                controls,
                client_id,
                capabilities,
            },
            poll,
            post,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn into_services(self) -> (PollService, PostService) {
        (self.poll, self.post)
    }
}
