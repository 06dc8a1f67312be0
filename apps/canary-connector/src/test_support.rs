use crate::canary::{ApiError, HistorianApi, SessionRequest, SessionTokens};
use crate::clock::Clock;
use crate::telemetry::{millis_to_dt, Quality, TagSample, TagValue};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::value::RawValue;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn sample_at(dataset: &str, tag: &str, ts_ms: i64, value: f64) -> TagSample {
    TagSample {
        tag_id: tag.to_string(),
        timestamp: millis_to_dt(ts_ms),
        value: TagValue::Float(value),
        quality: Quality::Good,
        dataset: dataset.to_string(),
    }
}

/// In-memory historian. Accepts everything unless a dataset is unknown (auto-create off) or a
/// store outcome was scripted.
#[derive(Default)]
pub struct FakeHistorian {
    pub unknown_datasets: Mutex<BTreeSet<String>>,
    pub auth_down: AtomicBool,
    scripted_store: Mutex<VecDeque<ApiError>>,
    scripted_keep_alive: Mutex<VecDeque<ApiError>>,
    pub store_attempts: Mutex<Vec<String>>,
    pub accepted: Mutex<Vec<String>>,
    pub session_requests: Mutex<Vec<SessionRequest>>,
    pub user_token_calls: AtomicU64,
    pub session_token_calls: AtomicU64,
    pub keep_alive_calls: AtomicU64,
    pub revoked_sessions: AtomicU64,
    pub revoked_users: AtomicU64,
}

impl FakeHistorian {
    pub fn with_unknown_dataset(name: &str) -> Self {
        let fake = Self::default();
        fake.unknown_datasets.lock().unwrap().insert(name.to_string());
        fake
    }

    pub fn fail_next_store(&self, err: ApiError) {
        self.scripted_store.lock().unwrap().push_back(err);
    }

    pub fn fail_next_keep_alive(&self, err: ApiError) {
        self.scripted_keep_alive.lock().unwrap().push_back(err);
    }

    pub fn accepted_sample_count(&self) -> usize {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .map(|raw| {
                let tvqs: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(raw).unwrap();
                tvqs.values()
                    .map(|v| v.as_array().map(Vec::len).unwrap_or(0))
                    .sum::<usize>()
            })
            .sum()
    }

    fn token_suffix(&self) -> u64 {
        self.session_token_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistorianApi for FakeHistorian {
    async fn get_user_token(&self, username: &str, _password: &str) -> Result<String, ApiError> {
        self.user_token_calls.fetch_add(1, Ordering::SeqCst);
        if self.auth_down.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("connection refused".into()));
        }
        Ok(format!("user-{username}"))
    }

    async fn get_session_token(
        &self,
        _user_token: &str,
        request: &SessionRequest,
    ) -> Result<String, ApiError> {
        if self.auth_down.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("connection refused".into()));
        }
        self.session_requests.lock().unwrap().push(request.clone());
        let n = self.session_token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("session-{n}"))
    }

    async fn keep_alive(&self, tokens: &SessionTokens) -> Result<(), ApiError> {
        self.keep_alive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_keep_alive.lock().unwrap().pop_front() {
            return Err(err);
        }
        if tokens.session_token != format!("session-{}", self.token_suffix()) {
            return Err(ApiError::BadTokens("BadSessionId".into()));
        }
        Ok(())
    }

    async fn store_data(&self, _tokens: &SessionTokens, tvqs: &RawValue) -> Result<(), ApiError> {
        let raw = tvqs.get().to_string();
        self.store_attempts.lock().unwrap().push(raw.clone());
        if let Some(err) = self.scripted_store.lock().unwrap().pop_front() {
            return Err(err);
        }
        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&raw).map_err(|err| ApiError::Decode(err.to_string()))?;
        let unknown = self.unknown_datasets.lock().unwrap();
        let rejected: Vec<String> = parsed
            .keys()
            .filter_map(|key| key.split('.').next())
            .filter(|dataset| unknown.contains(*dataset))
            .map(|dataset| format!("Dataset '{dataset}' does not exist"))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !rejected.is_empty() {
            return Err(ApiError::Rejected(rejected));
        }
        self.accepted.lock().unwrap().push(raw);
        Ok(())
    }

    async fn revoke_session_token(&self, _tokens: &SessionTokens) -> Result<(), ApiError> {
        self.revoked_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn revoke_user_token(&self, _user_token: &str) -> Result<(), ApiError> {
        self.revoked_users.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
