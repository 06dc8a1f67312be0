use crate::error::ConfigurationError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "/etc/canary-connector/CanaryConnectorConfig.json";
const CONFIG_PATH_ENV: &str = "CANARY_CONNECTOR_CONFIG_PATH";

pub const PLACEHOLDER_URL: &str = "https://<USER-DOMAIN>:PORT_NUM/";
pub const PLACEHOLDER_USER_NAME: &str = "<USER-NAME>";
pub const PLACEHOLDER_USER_PASSWORD: &str = "<USER-PASSWORD>";
pub const HOSTNAME_FILLER: &str = "%HOSTNAME%";

/// `QueueDataPollMaxBehindTimeMins` value that turns the max-behind check off.
pub const BEHIND_CHECK_DISABLED: i64 = -1;

const MAX_LOG_LEVEL: u8 = 6;
/// Ceiling for minute-valued spans (ten years).
const MAX_SPAN_MINS: u64 = 10 * 366 * 24 * 60;
const MAX_SETTLE_SECONDS: u64 = 3600;

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectorConfig {
    pub general: GeneralConfig,
    pub canary: CanaryConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GeneralConfig {
    pub log_level: u8,
    pub queue_enable_diagnostic_tags: bool,
    pub queue_enable_string_history: bool,
    pub utf8_string_support: bool,
    pub queue_data_poll_size_mins: u64,
    pub queue_data_poll_interval_millis: u64,
    pub queue_data_poll_warn_behind_time_mins: i64,
    pub queue_data_poll_max_behind_time_mins: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: 3,
            queue_enable_diagnostic_tags: false,
            queue_enable_string_history: false,
            utf8_string_support: false,
            queue_data_poll_size_mins: 5,
            queue_data_poll_interval_millis: 0,
            queue_data_poll_warn_behind_time_mins: 4,
            queue_data_poll_max_behind_time_mins: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CanaryConfig {
    pub api: ApiConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistorianNames {
    One(String),
    Many(Vec<String>),
}

impl HistorianNames {
    pub fn names(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            HistorianNames::One(name) => vec![name.as_str()],
            HistorianNames::Many(names) => names.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiConfig {
    pub url: String,
    pub sender_api_version_number: String,
    pub receiver_api_version_number: String,
    pub historian_server_name: HistorianNames,
    pub api_client_id: String,
    pub api_client_timeout_seconds: u64,
    pub file_size_megabytes: u64,
    pub auto_create_datasets: bool,
    pub auto_write_no_data: bool,
    pub extend_data: bool,
    pub insert_replace_data: bool,
    pub queue_data_post_rate_millis: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: PLACEHOLDER_URL.to_string(),
            sender_api_version_number: "v1".to_string(),
            receiver_api_version_number: "v2".to_string(),
            historian_server_name: HistorianNames::One("localhost".to_string()),
            api_client_id: HOSTNAME_FILLER.to_string(),
            api_client_timeout_seconds: 300,
            file_size_megabytes: 8,
            auto_create_datasets: true,
            auto_write_no_data: false,
            extend_data: true,
            insert_replace_data: false,
            queue_data_post_rate_millis: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthConfig {
    pub user_name: String,
    pub user_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_name: PLACEHOLDER_USER_NAME.to_string(),
            user_password: PLACEHOLDER_USER_PASSWORD.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LocalConfig {
    pub queue_directory: PathBuf,
    pub checkpoint_path: PathBuf,
    /// Empty disables the status listener.
    pub status_http_bind: String,
    pub initial_lookback_mins: u64,
    /// How far behind real time windows stop, for producers that write late.
    pub queue_settle_seconds: u64,
    pub max_buffered_samples: usize,
    pub max_samples_per_post: usize,
    pub queue_segment_roll_mins: u64,
    pub queue_retention_hours: u64,
    pub session_renew_margin_seconds: u64,
    pub http_timeout_seconds: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            queue_directory: PathBuf::from("/var/lib/canary-connector/queue"),
            checkpoint_path: PathBuf::from("/var/lib/canary-connector/checkpoint.json"),
            status_http_bind: "127.0.0.1:9102".to_string(),
            initial_lookback_mins: 0,
            queue_settle_seconds: 5,
            max_buffered_samples: 100_000,
            max_samples_per_post: 1000,
            queue_segment_roll_mins: 60,
            queue_retention_hours: 24,
            session_renew_margin_seconds: 8,
            http_timeout_seconds: 30,
        }
    }
}

impl ConnectorConfig {
    /// Loads the configuration file, writing the documented defaults first when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            write_default_config(path)?;
        }
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let mut config: ConnectorConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        config.resolve_client_id(sysinfo::System::host_name().as_deref());
        Ok(config)
    }

    pub fn resolve_client_id(&mut self, host_name: Option<&str>) {
        if !self.canary.api.api_client_id.contains(HOSTNAME_FILLER) {
            return;
        }
        let host = host_name
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("canary-connector");
        self.canary.api.api_client_id = self.canary.api.api_client_id.replace(HOSTNAME_FILLER, host);
        tracing::debug!(client_id = %self.canary.api.api_client_id, "resolved API client id");
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let general = &self.general;
        let api = &self.canary.api;
        let auth = &self.canary.auth;

        if general.log_level > MAX_LOG_LEVEL {
            return Err(ConfigurationError::Invalid {
                field: "General.LogLevel",
                reason: format!("{} is outside 0-{MAX_LOG_LEVEL}", general.log_level),
            });
        }
        if general.queue_data_poll_size_mins == 0 {
            return Err(ConfigurationError::Invalid {
                field: "General.QueueDataPollSizeMins",
                reason: "must be at least one minute".to_string(),
            });
        }
        check_span("General.QueueDataPollSizeMins", general.queue_data_poll_size_mins)?;
        if general.queue_data_poll_warn_behind_time_mins < BEHIND_CHECK_DISABLED {
            return Err(ConfigurationError::Invalid {
                field: "General.QueueDataPollWarnBehindTimeMins",
                reason: "must be -1 or a non-negative number of minutes".to_string(),
            });
        }
        if general.queue_data_poll_max_behind_time_mins < BEHIND_CHECK_DISABLED {
            return Err(ConfigurationError::Invalid {
                field: "General.QueueDataPollMaxBehindTimeMins",
                reason: "must be -1 or a non-negative number of minutes".to_string(),
            });
        }

        let url = api.url.trim();
        if url.is_empty() {
            return Err(ConfigurationError::Missing("Canary.Api.Url"));
        }
        if url == PLACEHOLDER_URL || url.contains("<USER-DOMAIN>") {
            return Err(ConfigurationError::Placeholder {
                field: "Canary.Api.Url",
                value: url.to_string(),
            });
        }
        Url::parse(url).map_err(|err| ConfigurationError::Invalid {
            field: "Canary.Api.Url",
            reason: err.to_string(),
        })?;
        if api.sender_api_version_number.trim().is_empty() {
            return Err(ConfigurationError::Missing("Canary.Api.SenderApiVersionNumber"));
        }
        if api.historian_server_name.names().is_empty() {
            return Err(ConfigurationError::Missing("Canary.Api.HistorianServerName"));
        }
        if api.api_client_id.trim().is_empty() {
            return Err(ConfigurationError::Missing("Canary.Api.ApiClientId"));
        }
        if api.api_client_timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                field: "Canary.Api.ApiClientTimeoutSeconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if api.file_size_megabytes == 0 {
            return Err(ConfigurationError::Invalid {
                field: "Canary.Api.FileSizeMegabytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if api.queue_data_post_rate_millis == 0 {
            return Err(ConfigurationError::Invalid {
                field: "Canary.Api.QueueDataPostRateMillis",
                reason: "must be greater than zero".to_string(),
            });
        }

        check_credential("Canary.Auth.UserName", &auth.user_name, PLACEHOLDER_USER_NAME)?;
        check_credential(
            "Canary.Auth.UserPassword",
            &auth.user_password,
            PLACEHOLDER_USER_PASSWORD,
        )?;

        if self.local.max_samples_per_post == 0 {
            return Err(ConfigurationError::Invalid {
                field: "Local.MaxSamplesPerPost",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.local.queue_segment_roll_mins == 0 {
            return Err(ConfigurationError::Invalid {
                field: "Local.QueueSegmentRollMins",
                reason: "must be greater than zero".to_string(),
            });
        }
        check_span("Local.QueueSegmentRollMins", self.local.queue_segment_roll_mins)?;
        check_span("Local.InitialLookbackMins", self.local.initial_lookback_mins)?;
        check_span(
            "Local.QueueRetentionHours",
            self.local.queue_retention_hours.saturating_mul(60),
        )?;
        if self.local.queue_settle_seconds > MAX_SETTLE_SECONDS {
            return Err(ConfigurationError::Invalid {
                field: "Local.QueueSettleSeconds",
                reason: format!("must be at most {MAX_SETTLE_SECONDS}"),
            });
        }
        Ok(())
    }

    /// `tracing` filter directive for `General.LogLevel` (cumulative 0-6 scale).
    pub fn log_filter(&self) -> &'static str {
        match self.general.log_level {
            0 => "off",
            1 | 2 => "error",
            3 => "warn",
            4 => "info",
            5 => "debug",
            _ => "trace",
        }
    }

    pub fn poll_size(&self) -> chrono::Duration {
        span_minutes(self.general.queue_data_poll_size_mins)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.general.queue_data_poll_interval_millis)
    }

    pub fn post_rate(&self) -> Duration {
        Duration::from_millis(self.canary.api.queue_data_post_rate_millis)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.canary.api.api_client_timeout_seconds)
    }

    pub fn session_renew_margin(&self) -> Duration {
        Duration::from_secs(self.local.session_renew_margin_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.local.http_timeout_seconds.max(1))
    }

    pub fn max_batch_bytes(&self) -> usize {
        (self.canary.api.file_size_megabytes as usize).saturating_mul(1024 * 1024)
    }

    pub fn initial_lookback(&self) -> chrono::Duration {
        span_minutes(self.local.initial_lookback_mins)
    }

    pub fn queue_settle(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.local.queue_settle_seconds.min(MAX_SETTLE_SECONDS) as i64)
    }

    pub fn segment_roll(&self) -> chrono::Duration {
        span_minutes(self.local.queue_segment_roll_mins.max(1))
    }

    pub fn queue_retention(&self) -> chrono::Duration {
        span_minutes(self.local.queue_retention_hours.saturating_mul(60))
    }

    /// `"{Url}/api/{SenderApiVersionNumber}/"`.
    pub fn api_base_url(&self) -> String {
        format!(
            "{}/api/{}/",
            self.canary.api.url.trim().trim_end_matches('/'),
            self.canary.api.sender_api_version_number.trim()
        )
    }

    pub fn status_bind(&self) -> Option<&str> {
        let bind = self.local.status_http_bind.trim();
        if bind.is_empty() {
            None
        } else {
            Some(bind)
        }
    }
}

fn span_minutes(mins: u64) -> chrono::Duration {
    chrono::Duration::minutes(mins.min(MAX_SPAN_MINS) as i64)
}

fn check_span(field: &'static str, mins: u64) -> Result<(), ConfigurationError> {
    if mins > MAX_SPAN_MINS {
        return Err(ConfigurationError::Invalid {
            field,
            reason: format!("must not exceed {MAX_SPAN_MINS} minutes"),
        });
    }
    Ok(())
}

fn check_credential(
    field: &'static str,
    value: &str,
    placeholder: &str,
) -> Result<(), ConfigurationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigurationError::Missing(field));
    }
    if trimmed == placeholder {
        return Err(ConfigurationError::Placeholder {
            field,
            value: trimmed.to_string(),
        });
    }
    Ok(())
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(&ConnectorConfig::default())?;
    fs::write(&tmp, json).context("write default config tmp")?;
    fs::rename(&tmp, path).context("rename default config")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config() -> ConnectorConfig {
        let mut config = ConnectorConfig::default();
        config.canary.api.url = "https://historian.example.com:55293".to_string();
        config.canary.auth.user_name = "svc-edge".to_string();
        config.canary.auth.user_password = "hunter2".to_string();
        config.canary.api.api_client_id = "Flexy-01".to_string();
        config
    }

    #[test]
    fn missing_file_generates_documented_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("CanaryConnectorConfig.json");

        let config = ConnectorConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.general.log_level, 3);
        assert_eq!(config.general.queue_data_poll_size_mins, 5);
        assert_eq!(config.general.queue_data_poll_interval_millis, 0);
        assert_eq!(config.general.queue_data_poll_warn_behind_time_mins, 4);
        assert_eq!(config.general.queue_data_poll_max_behind_time_mins, 10);
        assert_eq!(config.canary.api.api_client_timeout_seconds, 300);
        assert_eq!(config.canary.api.file_size_megabytes, 8);
        assert!(config.canary.api.auto_create_datasets);
        assert_eq!(config.canary.api.queue_data_post_rate_millis, 3000);
        assert!(!config.canary.api.api_client_id.contains(HOSTNAME_FILLER));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["General"]["QueueDataPollSizeMins"], 5);
        assert_eq!(raw["Canary"]["Api"]["SenderApiVersionNumber"], "v1");
        assert_eq!(raw["Canary"]["Auth"]["UserName"], PLACEHOLDER_USER_NAME);

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::Placeholder { field: "Canary.Api.Url", .. }));
    }

    #[test]
    fn partial_file_keeps_defaults_for_absent_keys() {
        let raw = r#"{
            "General": { "LogLevel": 5, "QueueDataPollMaxBehindTimeMins": -1 },
            "Canary": {
                "Api": {
                    "Url": "https://historian.local:55293/",
                    "HistorianServerName": ["hist-a", " hist-b ", ""],
                    "AutoCreateDatasets": false
                },
                "Auth": { "UserName": "edge", "UserPassword": "secret" }
            }
        }"#;
        let config: ConnectorConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.general.log_level, 5);
        assert_eq!(config.general.queue_data_poll_max_behind_time_mins, BEHIND_CHECK_DISABLED);
        assert_eq!(config.general.queue_data_poll_size_mins, 5);
        assert_eq!(
            config.canary.api.historian_server_name.names(),
            vec!["hist-a".to_string(), "hist-b".to_string()]
        );
        assert!(!config.canary.api.auto_create_datasets);
        assert_eq!(config.log_filter(), "debug");
        assert_eq!(config.api_base_url(), "https://historian.local:55293/api/v1/");
        config.validate().unwrap();
    }

    #[test]
    fn placeholder_credentials_are_rejected() {
        let mut config = valid_config();
        config.canary.auth.user_password = PLACEHOLDER_USER_PASSWORD.to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::Placeholder {
                field: "Canary.Auth.UserPassword",
                ..
            }
        ));

        config.canary.auth.user_name = "  ".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigurationError::Missing("Canary.Auth.UserName")
        ));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = valid_config();
        config.general.log_level = 7;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.general.queue_data_poll_max_behind_time_mins = -5;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.canary.api.queue_data_post_rate_millis = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_spans_are_rejected_and_clamped() {
        let mut config = valid_config();
        config.general.queue_data_poll_size_mins = u64::MAX;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigurationError::Invalid {
                field: "General.QueueDataPollSizeMins",
                ..
            }
        ));
        assert_eq!(config.poll_size(), chrono::Duration::minutes(MAX_SPAN_MINS as i64));

        let mut config = valid_config();
        config.local.initial_lookback_mins = (i64::MAX as u64) + 1;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigurationError::Invalid {
                field: "Local.InitialLookbackMins",
                ..
            }
        ));
        assert!(config.initial_lookback() > chrono::Duration::zero());

        let mut config = valid_config();
        config.local.queue_settle_seconds = 7200;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.local.queue_retention_hours = u64::MAX;
        assert!(config.validate().is_err());
        config.local.queue_retention_hours = 24;
        config.local.initial_lookback_mins = MAX_SPAN_MINS;
        config.validate().unwrap();
    }

    #[test]
    fn hostname_filler_is_replaced() {
        let mut config = valid_config();
        config.canary.api.api_client_id = "edge-%HOSTNAME%".to_string();
        config.resolve_client_id(Some("press-line-4"));
        assert_eq!(config.canary.api.api_client_id, "edge-press-line-4");

        config.canary.api.api_client_id = HOSTNAME_FILLER.to_string();
        config.resolve_client_id(None);
        assert_eq!(config.canary.api.api_client_id, "canary-connector");
    }

    #[test]
    fn log_levels_are_cumulative() {
        let mut config = valid_config();
        let expected = ["off", "error", "error", "warn", "info", "debug", "trace"];
        for (level, filter) in expected.iter().enumerate() {
            config.general.log_level = level as u8;
            assert_eq!(config.log_filter(), *filter);
        }
    }
}
