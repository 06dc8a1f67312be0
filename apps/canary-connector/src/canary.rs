pub mod client;
pub mod payload;

pub use client::CanaryClient;

use crate::config::ConnectorConfig;
use crate::error::DeliveryError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::value::RawValue;
use thiserror::Error;

/// Token pair required by every call after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub user_token: String,
    pub session_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Milliseconds.
    pub client_timeout: u64,
    pub file_size: u64,
    pub auto_create_datasets: bool,
    pub auto_write_no_data: bool,
    pub extend_data: bool,
    pub insert_replace_data: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub historians: Vec<String>,
    pub client_id: String,
    pub settings: SessionSettings,
}

impl SessionRequest {
    pub fn from_config(config: &ConnectorConfig) -> Self {
        let api = &config.canary.api;
        Self {
            historians: api.historian_server_name.names(),
            client_id: api.api_client_id.clone(),
            settings: SessionSettings {
                client_timeout: api.api_client_timeout_seconds.saturating_mul(1000),
                file_size: api.file_size_megabytes,
                auto_create_datasets: api.auto_create_datasets,
                auto_write_no_data: api.auto_write_no_data,
                extend_data: api.extend_data,
                insert_replace_data: api.insert_replace_data,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("historian returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("historian rejected the tokens: {0}")]
    BadTokens(String),
    #[error("historian reported errors: {}", .0.join("; "))]
    Rejected(Vec<String>),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_bad_tokens(&self) -> bool {
        matches!(self, ApiError::BadTokens(_))
    }
}

impl From<ApiError> for DeliveryError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::BadTokens(reason) => DeliveryError::Auth(reason),
            ApiError::Rejected(reasons) => DeliveryError::Permanent { reasons },
            ApiError::Status { status, body } if is_rejection_status(status) => {
                DeliveryError::Permanent {
                    reasons: vec![format!("HTTP {status}: {body}")],
                }
            }
            other => DeliveryError::Transient(other.to_string()),
        }
    }
}

/// 4xx other than request timeout and rate limiting.
fn is_rejection_status(status: u16) -> bool {
    (400..500).contains(&status) && status != 408 && status != 429
}

/// The remote tag historian's session-based write API.
#[async_trait]
pub trait HistorianApi: Send + Sync {
    async fn get_user_token(&self, username: &str, password: &str) -> Result<String, ApiError>;

    async fn get_session_token(
        &self,
        user_token: &str,
        request: &SessionRequest,
    ) -> Result<String, ApiError>;

    async fn keep_alive(&self, tokens: &SessionTokens) -> Result<(), ApiError>;

    /// Posts an already encoded `tvqs` object (see [`payload::encode_tvqs`]).
    async fn store_data(&self, tokens: &SessionTokens, tvqs: &RawValue) -> Result<(), ApiError>;

    async fn revoke_session_token(&self, tokens: &SessionTokens) -> Result<(), ApiError>;

    async fn revoke_user_token(&self, user_token: &str) -> Result<(), ApiError>;
}
