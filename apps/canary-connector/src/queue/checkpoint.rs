use crate::telemetry::millis_to_dt;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDisk {
    delivered_through_ms: i64,
    #[serde(default)]
    updated_at: Option<String>,
}

/// Durable delivered watermark: the end of the newest poll window whose samples were all
/// acknowledged or discarded by the historian.
pub struct CheckpointStore {
    path: PathBuf,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<DateTime<Utc>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).context("read checkpoint")?;
        let parsed: CheckpointDisk = serde_json::from_str(&raw).context("parse checkpoint")?;
        let watermark = millis_to_dt(parsed.delivered_through_ms);
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(watermark);
        }
        Ok(Some(watermark))
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.last.lock().ok().and_then(|guard| *guard)
    }

    /// Records `watermark` unless an equal or newer one is already stored. Returns whether the
    /// file was written.
    pub fn persist(&self, watermark: DateTime<Utc>) -> Result<bool> {
        let mut guard = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some_and(|current| current >= watermark) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let disk = CheckpointDisk {
            delivered_through_ms: watermark.timestamp_millis(),
            updated_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&disk)?).context("write checkpoint tmp")?;
        fs::rename(&tmp, &self.path).context("rename checkpoint")?;
        *guard = Some(watermark);
        Ok(true)
    }
}
