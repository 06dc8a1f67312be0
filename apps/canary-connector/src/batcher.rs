use crate::canary::payload;
use crate::telemetry::TagSample;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
enum Entry {
    Sample { sample: TagSample, bytes: usize },
    /// Every sample of the window ending here was appended before this mark.
    WindowEnd(DateTime<Utc>),
}

/// Samples taken from the front of the buffer, in append order.
#[derive(Debug, Default)]
pub struct Batch {
    pub samples: Vec<TagSample>,
    pub encoded_bytes: usize,
    /// Newest window end whose samples are all in this batch or earlier ones.
    pub watermark: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Debug, Default)]
struct Buffer {
    entries: VecDeque<Entry>,
    samples: usize,
    bytes: usize,
}

/// FIFO between the poll loop (append) and the post loop (drain). Both hold the lock only for the
/// in-memory move.
#[derive(Debug)]
pub struct Batcher {
    buffer: Mutex<Buffer>,
    max_samples_per_batch: usize,
}

impl Batcher {
    pub fn new(max_samples_per_batch: usize) -> Self {
        Self {
            buffer: Mutex::new(Buffer::default()),
            max_samples_per_batch: max_samples_per_batch.max(1),
        }
    }

    pub fn append(&self, samples: Vec<TagSample>) {
        self.push(samples, None);
    }

    /// Appends one read window's samples followed by its end mark.
    pub fn append_window(&self, samples: Vec<TagSample>, window_end: DateTime<Utc>) {
        self.push(samples, Some(window_end));
    }

    fn push(&self, samples: Vec<TagSample>, window_end: Option<DateTime<Utc>>) {
        let sized: Vec<Entry> = samples
            .into_iter()
            .map(|sample| Entry::Sample {
                bytes: payload::encoded_len(&sample),
                sample,
            })
            .collect();
        let mut buffer = self.lock();
        for entry in sized {
            if let Entry::Sample { bytes, .. } = &entry {
                buffer.samples += 1;
                buffer.bytes += *bytes;
            }
            buffer.entries.push_back(entry);
        }
        if let Some(end) = window_end {
            buffer.entries.push_back(Entry::WindowEnd(end));
        }
    }

    /// Removes the longest prefix that fits in `max_bytes` and the per-batch sample cap. A lone
    /// sample bigger than `max_bytes` is returned on its own.
    pub fn drain(&self, max_bytes: usize) -> Batch {
        let mut buffer = self.lock();
        let mut batch = Batch::default();
        loop {
            let fits = match buffer.entries.front() {
                None => break,
                Some(Entry::WindowEnd(_)) => true,
                Some(Entry::Sample { bytes, .. }) => {
                    batch.samples.is_empty()
                        || (batch.samples.len() < self.max_samples_per_batch
                            && batch.encoded_bytes + *bytes <= max_bytes)
                }
            };
            if !fits {
                break;
            }
            match buffer.entries.pop_front() {
                Some(Entry::WindowEnd(end)) => batch.watermark = Some(end),
                Some(Entry::Sample { sample, bytes }) => {
                    buffer.samples -= 1;
                    buffer.bytes -= bytes;
                    batch.encoded_bytes += bytes;
                    batch.samples.push(sample);
                }
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.lock().samples
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered_bytes(&self) -> usize {
        self.lock().bytes
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
