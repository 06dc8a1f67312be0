use super::{ApiError, HistorianApi, SessionRequest, SessionSettings, SessionTokens};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::Duration;
use url::Url;

const STATUS_GOOD: &str = "Good";
const STATUS_BAD_USER_TOKEN: &str = "BadUserToken";
const STATUS_BAD_SESSION_ID: &str = "BadSessionId";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct UserTokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionTokenRequest<'a> {
    user_token: &'a str,
    historians: &'a [String],
    client_id: &'a str,
    settings: &'a SessionSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokensRequest<'a> {
    user_token: &'a str,
    session_token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreDataRequest<'a> {
    user_token: &'a str,
    session_token: &'a str,
    tvqs: &'a RawValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RevokeUserTokenRequest<'a> {
    user_token: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ApiResponse {
    status_code: Option<String>,
    errors: Option<Vec<String>>,
    user_token: Option<String>,
    session_token: Option<String>,
}

impl ApiResponse {
    fn into_result(self) -> Result<Self, ApiError> {
        let status = self.status_code.as_deref().unwrap_or(STATUS_GOOD);
        if status == STATUS_BAD_USER_TOKEN || status == STATUS_BAD_SESSION_ID {
            return Err(ApiError::BadTokens(status.to_string()));
        }
        if let Some(errors) = self.errors.as_ref().filter(|errors| !errors.is_empty()) {
            return Err(ApiError::Rejected(errors.clone()));
        }
        if status != STATUS_GOOD {
            return Err(ApiError::Rejected(vec![format!("status {status}")]));
        }
        Ok(self)
    }
}

/// `reqwest` client for the historian's JSON write API rooted at `{Url}/api/{version}/`.
#[derive(Clone)]
pub struct CanaryClient {
    http: Client,
    base: Url,
}

impl CanaryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).with_context(|| format!("invalid API URL {base_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base })
    }

    async fn call<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<ApiResponse, ApiError> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|err| ApiError::Transport(format!("invalid endpoint {endpoint}: {err}")))?;
        let response = self
            .http
            .post(url)
            .header("X-Requested-With", "JSONHttpRequest")
            .json(body)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::BadTokens(format!("HTTP 401 from {endpoint}")));
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: truncate(text),
            });
        }
        let parsed: ApiResponse = serde_json::from_str(&text)
            .map_err(|err| ApiError::Decode(format!("{endpoint}: {err}")))?;
        tracing::trace!(endpoint, status = ?parsed.status_code, "historian call completed");
        parsed.into_result()
    }
}

#[async_trait]
impl HistorianApi for CanaryClient {
    async fn get_user_token(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let response = self
            .call("getUserToken", &UserTokenRequest { username, password })
            .await?;
        response
            .user_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::Decode("getUserToken: missing userToken".to_string()))
    }

    async fn get_session_token(
        &self,
        user_token: &str,
        request: &SessionRequest,
    ) -> Result<String, ApiError> {
        let body = SessionTokenRequest {
            user_token,
            historians: &request.historians,
            client_id: &request.client_id,
            settings: &request.settings,
        };
        let response = self.call("getSessionToken", &body).await?;
        response
            .session_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::Decode("getSessionToken: missing sessionToken".to_string()))
    }

    async fn keep_alive(&self, tokens: &SessionTokens) -> Result<(), ApiError> {
        self.call("keepAlive", &tokens_request(tokens)).await?;
        Ok(())
    }

    async fn store_data(&self, tokens: &SessionTokens, tvqs: &RawValue) -> Result<(), ApiError> {
        let body = StoreDataRequest {
            user_token: &tokens.user_token,
            session_token: &tokens.session_token,
            tvqs,
        };
        self.call("storeData", &body).await?;
        Ok(())
    }

    async fn revoke_session_token(&self, tokens: &SessionTokens) -> Result<(), ApiError> {
        self.call("revokeSessionToken", &tokens_request(tokens)).await?;
        Ok(())
    }

    async fn revoke_user_token(&self, user_token: &str) -> Result<(), ApiError> {
        self.call("revokeUserToken", &RevokeUserTokenRequest { user_token })
            .await?;
        Ok(())
    }
}

fn tokens_request(tokens: &SessionTokens) -> TokensRequest<'_> {
    TokensRequest {
        user_token: &tokens.user_token,
        session_token: &tokens.session_token,
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
