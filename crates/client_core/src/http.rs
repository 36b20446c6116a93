use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{RefreshRequest, RefreshResponse, TokenPair},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::{ClientEvent, TokenStore};

/// Refresh ahead of time instead of eating a guaranteed 401 when the access
/// token is about to lapse. The reactive 401 path below remains the contract
/// of record.
const PROACTIVE_REFRESH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("session expired; please log in again")]
    SessionExpired,
    #[error("{message}")]
    ContentPolicy { message: String },
    #[error("{code:?}: {message}")]
    Api { code: ErrorCode, message: String },
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ApiClientError {
    pub fn is_content_policy(&self) -> bool {
        matches!(self, ApiClientError::ContentPolicy { .. })
    }
}

struct SessionTokens {
    access_token: String,
    refresh_token: String,
}

impl SessionTokens {
    fn wipe(&mut self) {
        self.access_token.zeroize();
        self.refresh_token.zeroize();
    }
}

/// JSON-over-HTTPS transport for the learning backend. Owns the bearer
/// session: attaches the access token to every authenticated call, performs
/// the one-shot refresh-and-retry on 401, and tears the session down when the
/// refresh token is rejected too.
pub struct ApiClient {
    http: Client,
    base_url: String,
    token_store: Arc<dyn TokenStore>,
    session: Mutex<Option<SessionTokens>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token_store: Arc<dyn TokenStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token_store,
            session: Mutex::new(None),
            events,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn set_session(&self, tokens: TokenPair, persist: bool) {
        if persist {
            if let Err(err) = self.token_store.save(&tokens).await {
                warn!("failed to persist session tokens: {err}");
            }
        }
        let mut guard = self.session.lock().await;
        if let Some(mut old) = guard.replace(SessionTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        }) {
            old.wipe();
        }
    }

    /// Loads a persisted token pair into the in-memory session, if one exists.
    pub async fn restore_from_store(&self) -> anyhow::Result<bool> {
        let Some(tokens) = self.token_store.load().await? else {
            return Ok(false);
        };
        self.set_session(tokens, false).await;
        Ok(true)
    }

    pub async fn clear_session(&self) {
        if let Some(mut old) = self.session.lock().await.take() {
            old.wipe();
        }
        if let Err(err) = self.token_store.clear().await {
            warn!("failed to clear persisted session tokens: {err}");
        }
    }

    async fn expire_session(&self) {
        info!("session expired after failed token refresh");
        self.clear_session().await;
        let _ = self.events.send(ClientEvent::SessionExpired);
    }

    /// Unauthenticated JSON POST, used by login/register/refresh.
    pub async fn post_public<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiClientError> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiClientError> {
        let response = self
            .send_authed(Method::GET, path, None, Some(query))
            .await?;
        Ok(response.json().await?)
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiClientError> {
        let body = serde_json::to_value(body)?;
        let response = self
            .send_authed(Method::POST, path, Some(body), None)
            .await?;
        Ok(response.json().await?)
    }

    pub async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ApiClientError> {
        let body = serde_json::to_value(body)?;
        self.send_authed(Method::POST, path, Some(body), None)
            .await?;
        Ok(())
    }

    pub async fn post_empty(&self, path: &str) -> Result<(), ApiClientError> {
        self.send_authed(Method::POST, path, None, None).await?;
        Ok(())
    }

    pub async fn put_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ApiClientError> {
        let body = serde_json::to_value(body)?;
        self.send_authed(Method::PUT, path, Some(body), None).await?;
        Ok(())
    }

    async fn send_authed(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        query: Option<&[(&str, String)]>,
    ) -> Result<reqwest::Response, ApiClientError> {
        let bearer = self.bearer_token().await?;
        let response = self
            .send_once(&method, path, body.as_ref(), query, &bearer)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check_status(response).await;
        }

        // Exactly one refresh attempt, then one retry of the original
        // request. A second rejection ends the session.
        let bearer = match self.refresh_session().await {
            Ok(bearer) => bearer,
            Err(err) => {
                warn!("token refresh after 401 failed: {err}");
                self.expire_session().await;
                return Err(ApiClientError::SessionExpired);
            }
        };
        let retried = self
            .send_once(&method, path, body.as_ref(), query, &bearer)
            .await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            self.expire_session().await;
            return Err(ApiClientError::SessionExpired);
        }
        Self::check_status(retried).await
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
        query: Option<&[(&str, String)]>,
        bearer: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(bearer);
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await
    }

    async fn bearer_token(&self) -> Result<String, ApiClientError> {
        let (access_token, near_expiry) = {
            let guard = self.session.lock().await;
            let tokens = guard.as_ref().ok_or(ApiClientError::NotLoggedIn)?;
            (
                tokens.access_token.clone(),
                access_token_near_expiry(&tokens.access_token),
            )
        };
        if !near_expiry {
            return Ok(access_token);
        }
        match self.refresh_session().await {
            Ok(fresh) => Ok(fresh),
            Err(err) => {
                // The current token may still be accepted; let the 401 path
                // decide.
                warn!("proactive token refresh failed: {err}");
                Ok(access_token)
            }
        }
    }

    async fn refresh_session(&self) -> Result<String, ApiClientError> {
        let refresh_token = {
            let guard = self.session.lock().await;
            guard
                .as_ref()
                .ok_or(ApiClientError::NotLoggedIn)?
                .refresh_token
                .clone()
        };

        let refreshed: RefreshResponse = self
            .post_public(
                "/auth/refresh",
                &RefreshRequest {
                    refresh_token: refresh_token.clone(),
                },
            )
            .await?;

        let pair = TokenPair {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.unwrap_or(refresh_token),
        };
        {
            let mut guard = self.session.lock().await;
            if let Some(tokens) = guard.as_mut() {
                tokens.wipe();
                tokens.access_token = pair.access_token.clone();
                tokens.refresh_token = pair.refresh_token.clone();
            }
        }
        if let Err(err) = self.token_store.save(&pair).await {
            warn!("failed to persist refreshed tokens: {err}");
        }
        Ok(pair.access_token)
    }

    async fn check_status(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ApiClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(Self::error_from_response(status, response).await)
    }

    async fn error_from_response(
        status: StatusCode,
        response: reqwest::Response,
    ) -> ApiClientError {
        match response.json::<ApiError>().await {
            Ok(body) if is_content_policy_rejection(body.code, &body.message) => {
                ApiClientError::ContentPolicy {
                    message: body.message,
                }
            }
            Ok(body) => ApiClientError::Api {
                code: body.code,
                message: body.message,
            },
            Err(_) => ApiClientError::Api {
                code: code_for_status(status),
                message: format!("unexpected http status {status}"),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    exp: u64,
}

/// Reads the access token's `exp` claim without verifying the signature; the
/// client never validates tokens, it only schedules refreshes. Opaque or
/// malformed tokens simply fall through to the reactive 401 path.
fn access_token_near_expiry(token: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    let Ok(data) = decode::<BearerClaims>(token, &DecodingKey::from_secret(&[]), &validation)
    else {
        return false;
    };
    let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return false;
    };
    data.claims.exp.saturating_sub(now.as_secs()) <= PROACTIVE_REFRESH_WINDOW.as_secs()
}

fn is_content_policy_rejection(code: ErrorCode, message: &str) -> bool {
    if code == ErrorCode::ContentPolicy {
        return true;
    }
    if code != ErrorCode::Validation {
        return false;
    }
    let message = message.to_ascii_lowercase();
    message.contains("content policy")
        || message.contains("inappropriate")
        || message.contains("flagged by moderation")
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status.as_u16() {
        401 => ErrorCode::Unauthorized,
        403 => ErrorCode::Forbidden,
        404 => ErrorCode::NotFound,
        400 | 422 => ErrorCode::Validation,
        429 => ErrorCode::RateLimited,
        _ => ErrorCode::Internal,
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
