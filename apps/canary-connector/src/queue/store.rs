use super::{QueueCapabilities, QueueSource};
use crate::error::{LateSampleError, SourceReadError};
use crate::telemetry::{millis_to_dt, PollWindow, Quality, TagSample, TagValue};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".q";
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One frame payload on disk.
#[derive(Debug, Serialize, Deserialize)]
struct QueueRecord {
    tag: String,
    ts: i64,
    v: TagValue,
    #[serde(default)]
    q: Quality,
    ds: String,
}

impl QueueRecord {
    fn from_sample(sample: &TagSample) -> Self {
        Self {
            tag: sample.tag_id.clone(),
            ts: sample.timestamp.timestamp_millis(),
            v: sample.value.clone(),
            q: sample.quality,
            ds: sample.dataset.clone(),
        }
    }

    fn into_sample(self, utf8_tag_names: bool) -> TagSample {
        let tag_id = if utf8_tag_names {
            self.tag
        } else {
            latin1_decode(&self.tag)
        };
        TagSample {
            tag_id,
            timestamp: millis_to_dt(self.ts),
            value: self.v,
            quality: self.q,
            dataset: self.ds,
        }
    }
}

/// Append-only segment store standing in for the device's historical queue.
///
/// Segments cover fixed time buckets (`seg-<bucket_start_ms>.q`) and hold crc32c framed JSON
/// records. A torn or corrupt frame ends the read of that segment, and is cut off before the
/// segment is next appended to.
///
/// Every successful window read moves the read horizon to the window end. Appends stamped before
/// the horizon are refused with [`LateSampleError`], since no later window would cover them.
pub struct QueueStore {
    dir: PathBuf,
    roll_ms: i64,
    io: Mutex<IoState>,
}

#[derive(Debug, Default)]
struct IoState {
    read_horizon_ms: Option<i64>,
    /// Buckets whose tail has been checked since `open`.
    recovered: HashSet<i64>,
}

impl QueueStore {
    pub fn open(dir: impl Into<PathBuf>, roll: ChronoDuration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            dir,
            roll_ms: roll.num_milliseconds().max(1),
            io: Mutex::new(IoState::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Refuses appends before `ts` from now on. The horizon never moves back.
    pub fn seal_before(&self, ts: DateTime<Utc>) {
        let mut io = self.lock_io();
        io.raise_horizon(ts.timestamp_millis());
    }

    pub fn read_horizon(&self) -> Option<DateTime<Utc>> {
        self.lock_io().read_horizon_ms.map(millis_to_dt)
    }

    pub fn append(&self, samples: &[TagSample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let mut by_bucket: BTreeMap<i64, Vec<Vec<u8>>> = BTreeMap::new();
        for sample in samples {
            let payload = serde_json::to_vec(&QueueRecord::from_sample(sample))?;
            by_bucket
                .entry(self.bucket_of(sample.timestamp))
                .or_default()
                .push(payload);
        }

        let mut io = self.lock_io();
        if let Some(horizon_ms) = io.read_horizon_ms {
            let late: Vec<&TagSample> = samples
                .iter()
                .filter(|sample| sample.timestamp.timestamp_millis() < horizon_ms)
                .collect();
            if let Some(oldest) = late.iter().map(|sample| sample.timestamp).min() {
                let horizon = millis_to_dt(horizon_ms);
                for sample in &late {
                    tracing::warn!(
                        tag = %sample.tag_id,
                        dataset = %sample.dataset,
                        timestamp = %sample.timestamp,
                        %horizon,
                        "rejected sample older than the queue read horizon"
                    );
                }
                return Err(LateSampleError {
                    count: late.len(),
                    oldest,
                    horizon,
                }
                .into());
            }
        }

        for (bucket, payloads) in by_bucket {
            let path = segment_path(&self.dir, bucket);
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            if !io.recovered.contains(&bucket) {
                let cut = recover_truncate_tail(&mut file)
                    .with_context(|| format!("failed to recover {}", path.display()))?;
                if cut > 0 {
                    tracing::warn!(segment = %path.display(), bytes = cut, "truncated torn queue segment tail");
                }
                io.recovered.insert(bucket);
            }
            file.seek(SeekFrom::End(0))?;
            let mut buf = Vec::new();
            for payload in payloads {
                buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&crc32c(&payload).to_le_bytes());
                buf.extend_from_slice(&payload);
            }
            file.write_all(&buf)
                .with_context(|| format!("failed to append to {}", path.display()))?;
            file.flush()?;
        }
        tracing::trace!(count = samples.len(), "appended samples to local queue");
        Ok(samples.len())
    }

    /// Deletes segments whose bucket ends at or before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut io = self.lock_io();
        let mut removed = 0;
        for (bucket, path) in list_segments(&self.dir)? {
            if bucket.saturating_add(self.roll_ms) > cutoff_ms {
                continue;
            }
            fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
            io.recovered.remove(&bucket);
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!(removed, cutoff = %cutoff, "pruned local queue segments");
        }
        Ok(removed)
    }

    fn bucket_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis().div_euclid(self.roll_ms) * self.roll_ms
    }

    fn lock_io(&self) -> MutexGuard<'_, IoState> {
        match self.io.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_window_inner(
        &self,
        window: &PollWindow,
        capabilities: QueueCapabilities,
    ) -> Result<Vec<TagSample>> {
        let start_ms = window.start.timestamp_millis();
        let end_ms = window.end.timestamp_millis();
        let mut io = self.lock_io();

        let mut samples = Vec::new();
        let mut skipped_text = 0usize;
        for (bucket, path) in list_segments(&self.dir)? {
            if bucket >= end_ms || bucket.saturating_add(self.roll_ms) <= start_ms {
                continue;
            }
            let mut file = fs::File::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            while let Some(payload) = read_next_frame_payload(&mut file)? {
                let record: QueueRecord = match serde_json::from_slice(&payload) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(segment = %path.display(), error = %err, "skipping undecodable queue record");
                        continue;
                    }
                };
                if record.ts < start_ms || record.ts >= end_ms {
                    continue;
                }
                if record.v.is_text() && !capabilities.string_history {
                    skipped_text += 1;
                    continue;
                }
                samples.push(record.into_sample(capabilities.utf8_tag_names));
            }
        }
        samples.sort_by_key(|sample| sample.timestamp);
        io.raise_horizon(end_ms);
        if skipped_text > 0 {
            tracing::trace!(skipped_text, %window, "string history disabled; text samples excluded");
        }
        Ok(samples)
    }
}

impl IoState {
    fn raise_horizon(&mut self, ms: i64) {
        self.read_horizon_ms = Some(self.read_horizon_ms.map_or(ms, |current| current.max(ms)));
    }
}

impl QueueSource for QueueStore {
    fn read_window(
        &self,
        window: &PollWindow,
        capabilities: QueueCapabilities,
    ) -> Result<Vec<TagSample>, SourceReadError> {
        self.read_window_inner(window, capabilities)
            .map_err(|err| SourceReadError::Unavailable {
                window: *window,
                reason: format!("{err:#}"),
            })
    }
}

fn latin1_decode(name: &str) -> String {
    name.bytes().map(char::from).collect()
}

fn segment_path(dir: &Path, bucket_start_ms: i64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{bucket_start_ms}{SEGMENT_SUFFIX}"))
}

fn parse_segment_bucket(name: &str) -> Option<i64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

fn list_segments(dir: &Path) -> Result<Vec<(i64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(bucket) = parse_segment_bucket(name) {
            segments.push((bucket, entry.path()));
        }
    }
    segments.sort_by_key(|(bucket, _)| *bucket);
    Ok(segments)
}

fn read_next_frame_payload(file: &mut fs::File) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len == 0 || len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    match file.read_exact(&mut payload) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    if crc32c(&payload) != crc {
        return Ok(None);
    }

    Ok(Some(payload))
}

/// Cuts the file back to the end of its last intact frame. Returns the number of bytes removed.
fn recover_truncate_tail(file: &mut fs::File) -> Result<u64> {
    let end = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    let mut pos = 0u64;
    while let Some(payload) = read_next_frame_payload(file)? {
        pos = pos.saturating_add(8 + payload.len() as u64);
    }
    if pos < end {
        file.set_len(pos)?;
    }
    file.seek(SeekFrom::End(0))?;
    Ok(end - pos)
}
