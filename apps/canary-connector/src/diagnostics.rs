use crate::clock::Clock;
use crate::queue::QueueStore;
use crate::telemetry::{Quality, TagSample, TagValue};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const HEARTBEAT_SUFFIX: &str = "QueueHeartbeat";
const RESET_TRIGGER_SUFFIX: &str = "QueueResetTrigger";
const BEHIND_SECONDS_SUFFIX: &str = "QueueBehindSeconds";

/// Writes the connector's own health tags back into the local queue so they travel the same path
/// as device data. Also carries the operator reset trigger.
pub struct DiagnosticPublisher {
    store: Arc<QueueStore>,
    clock: Arc<dyn Clock>,
    client_id: String,
    enabled: bool,
    heartbeat: AtomicU64,
    reset_requested: AtomicBool,
}

impl DiagnosticPublisher {
    pub fn new(store: Arc<QueueStore>, clock: Arc<dyn Clock>, client_id: impl Into<String>, enabled: bool) -> Self {
        Self {
            store,
            clock,
            client_id: client_id.into(),
            enabled,
            heartbeat: AtomicU64::new(0),
            reset_requested: AtomicBool::new(false),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
        tracing::info!("queue reset trigger set");
    }

    /// Consumes a pending reset request.
    pub fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    /// Records one poll attempt. `reset_fired` is published as 1 for this attempt only.
    pub fn publish(&self, behind_seconds: f64, reset_fired: bool) -> Result<()> {
        let count = self.heartbeat.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.enabled {
            return Ok(());
        }
        let now = self.clock.now();
        let tag = |suffix: &str, value: TagValue| TagSample {
            tag_id: format!("{}{suffix}", self.client_id),
            timestamp: now,
            value,
            quality: Quality::Good,
            dataset: self.client_id.clone(),
        };
        let samples = [
            tag(HEARTBEAT_SUFFIX, TagValue::Integer(count as i64)),
            tag(RESET_TRIGGER_SUFFIX, TagValue::Integer(i64::from(reset_fired))),
            tag(BEHIND_SECONDS_SUFFIX, TagValue::Integer(behind_seconds.round() as i64)),
        ];
        self.store.append(&samples)?;
        tracing::trace!(heartbeat = count, behind_seconds, reset_fired, "published diagnostic tags");
        Ok(())
    }
}
