use crate::canary::{ApiError, HistorianApi, SessionRequest, SessionTokens};
use crate::clock::Clock;
use crate::error::AuthFailure;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Active,
    Expiring,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub issued_at: Option<DateTime<Utc>>,
    pub renew_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
struct Session {
    tokens: SessionTokens,
    issued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    session: Option<Session>,
}

/// Owns the historian tokens. Renewal happens under the lock, so no caller can use a token while
/// it is being replaced.
pub struct SessionManager {
    api: Arc<dyn HistorianApi>,
    clock: Arc<dyn Clock>,
    credentials: Credentials,
    request: SessionRequest,
    timeout: ChronoDuration,
    margin: ChronoDuration,
    inner: Mutex<Inner>,
    status: std::sync::Mutex<SessionStatus>,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn HistorianApi>,
        clock: Arc<dyn Clock>,
        credentials: Credentials,
        request: SessionRequest,
        timeout: std::time::Duration,
        margin: std::time::Duration,
    ) -> Self {
        let timeout = ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::seconds(300));
        let mut margin = ChronoDuration::from_std(margin).unwrap_or(ChronoDuration::zero());
        if margin >= timeout {
            margin = timeout / 2;
            tracing::warn!(
                margin_ms = margin.num_milliseconds(),
                "session renew margin not below the client timeout; using half the timeout"
            );
        }
        Self {
            api,
            clock,
            credentials,
            request,
            timeout,
            margin,
            inner: Mutex::new(Inner {
                state: SessionState::Unauthenticated,
                session: None,
            }),
            status: std::sync::Mutex::new(SessionStatus {
                state: SessionState::Unauthenticated,
                issued_at: None,
                renew_at: None,
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Tokens that stay valid for at least the renew margin, renewing or re-authenticating first
    /// when needed.
    pub async fn get_valid_token(&self) -> Result<SessionTokens, AuthFailure> {
        let mut inner = self.inner.lock().await;
        let now = self.clock.now();

        if let Some(session) = inner.session.as_ref() {
            if now < self.renew_at(session.issued_at) {
                return Ok(session.tokens.clone());
            }
            if now >= session.issued_at + self.timeout {
                tracing::info!(issued_at = %session.issued_at, "historian session timed out; re-authenticating");
                inner.session = None;
            }
        }

        if let Some(tokens) = inner.session.as_ref().map(|s| s.tokens.clone()) {
            self.set_state(&mut inner, SessionState::Expiring);
            match self.api.keep_alive(&tokens).await {
                Ok(()) => {
                    if let Some(session) = inner.session.as_mut() {
                        session.issued_at = now;
                    }
                    self.set_state(&mut inner, SessionState::Active);
                    tracing::debug!("historian session renewed");
                    return Ok(tokens);
                }
                Err(err) if err.is_bad_tokens() => {
                    tracing::info!(error = %err, "historian dropped the session; re-authenticating");
                    inner.session = None;
                }
                Err(err) => {
                    self.set_state(&mut inner, SessionState::Expired);
                    tracing::warn!(error = %err, "historian session renewal failed");
                    return Err(AuthFailure::new(format!("keepAlive: {err}")));
                }
            }
        }

        self.authenticate(&mut inner, now).await
    }

    async fn authenticate(
        &self,
        inner: &mut Inner,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, AuthFailure> {
        let fallback = if inner.state == SessionState::Unauthenticated {
            SessionState::Unauthenticated
        } else {
            SessionState::Expired
        };
        self.set_state(inner, SessionState::Authenticating);

        let result = async {
            let user_token = self
                .api
                .get_user_token(&self.credentials.username, &self.credentials.password)
                .await
                .map_err(|err| auth_failure("getUserToken", err))?;
            let session_token = self
                .api
                .get_session_token(&user_token, &self.request)
                .await
                .map_err(|err| auth_failure("getSessionToken", err))?;
            Ok::<_, AuthFailure>(SessionTokens {
                user_token,
                session_token,
            })
        }
        .await;

        match result {
            Ok(tokens) => {
                inner.session = Some(Session {
                    tokens: tokens.clone(),
                    issued_at: now,
                });
                self.set_state(inner, SessionState::Active);
                tracing::info!(
                    client_id = %self.request.client_id,
                    historians = ?self.request.historians,
                    "historian session established"
                );
                Ok(tokens)
            }
            Err(err) => {
                self.set_state(inner, fallback);
                tracing::warn!(error = %err, "historian authentication failed");
                Err(err)
            }
        }
    }

    /// A request on the current session succeeded; the historian restarts its idle timer.
    pub async fn touch(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.session.as_mut() {
            session.issued_at = now;
        }
        let state = inner.state;
        self.set_state(&mut inner, state);
    }

    /// The historian rejected the tokens. The next call re-authenticates.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session.take().is_some() {
            self.set_state(&mut inner, SessionState::Expired);
        }
    }

    /// Best-effort release of both tokens.
    pub async fn revoke(&self) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.take() else {
            return;
        };
        if let Err(err) = self.api.revoke_session_token(&session.tokens).await {
            tracing::debug!(error = %err, "revokeSessionToken failed");
        }
        if let Err(err) = self.api.revoke_user_token(&session.tokens.user_token).await {
            tracing::debug!(error = %err, "revokeUserToken failed");
        }
        self.set_state(&mut inner, SessionState::Unauthenticated);
        tracing::info!("historian session revoked");
    }

    fn renew_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        issued_at + self.timeout - self.margin
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        inner.state = state;
        let issued_at = inner.session.as_ref().map(|s| s.issued_at);
        let snapshot = SessionStatus {
            state,
            issued_at,
            renew_at: issued_at.map(|at| self.renew_at(at)),
        };
        match self.status.lock() {
            Ok(mut status) => *status = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

fn auth_failure(call: &str, err: ApiError) -> AuthFailure {
    AuthFailure::new(format!("{call}: {err}"))
}
