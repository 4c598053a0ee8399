//! OAuth2 client-credentials tokens and the shared token cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::AuthError;

// ─── Credential ───────────────────────────────────────────────────────────

/// An issued access token. Replaced wholesale on refresh, never mutated.
#[derive(Clone)]
pub struct Credential {
    access_token: String,
    expires_at: DateTime<Utc>,
    scope: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_in: Duration, scope: impl Into<String>) -> Self {
        let lifetime = chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::zero());
        Self {
            access_token: access_token.into(),
            expires_at: Utc::now() + lifetime,
            scope: scope.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Usable at `now` with at least `margin` of lifetime left.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

// ─── TokenSource ──────────────────────────────────────────────────────────

/// Something that can mint a fresh [`Credential`].
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential, AuthError>;
}

/// App registration used for the client-credentials grant.
#[derive(Clone)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Environment URL the token is for, e.g. `https://org.crm.dynamics.com`.
    pub resource: String,
    pub scope: Option<String>,
    pub authority: Option<String>,
}

impl ClientCredentials {
    pub fn scope(&self) -> String {
        match &self.scope {
            Some(scope) => scope.clone(),
            None => format!("{}/.default", self.resource.trim_end_matches('/')),
        }
    }

    pub fn token_url(&self) -> String {
        let authority = match &self.authority {
            Some(a) => a.trim_end_matches('/').to_string(),
            None => format!("https://login.microsoftonline.com/{}", self.tenant_id),
        };
        format!("{authority}/oauth2/v2.0/token")
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("resource", &self.resource)
            .field("scope", &self.scope)
            .field("authority", &self.authority)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "seconds")]
    expires_in: u64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// `expires_in` arrives as a number from v2.0 endpoints and as a string from
/// some v1-compatible authorities.
fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }
    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Client-credentials grant over HTTP.
///
/// Transport failures and 5xx answers from the token endpoint are retried
/// with doubling delay up to `max_delay`; a 4xx is the identity provider
/// refusing the credentials and is returned immediately.
pub struct ClientCredentialsSource {
    http: reqwest::Client,
    credentials: ClientCredentials,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ClientCredentialsSource {
    pub fn new(http: reqwest::Client, credentials: ClientCredentials) -> Self {
        Self {
            http,
            credentials,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    async fn attempt(&self, url: &str, scope: &str) -> Result<Credential, Attempt> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", scope),
        ];
        let resp = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Attempt::Retry(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Attempt::Retry(e.to_string()))?;

        if status.is_success() {
            let token: TokenResponse = serde_json::from_str(&body)
                .map_err(|e| Attempt::Fail(AuthError::MalformedResponse(e.to_string())))?;
            return Ok(Credential::new(
                token.access_token,
                Duration::from_secs(token.expires_in),
                scope,
            ));
        }
        if status.is_server_error() {
            return Err(Attempt::Retry(format!("token endpoint returned HTTP {status}")));
        }

        let rejection: TokenErrorResponse =
            serde_json::from_str(&body).unwrap_or(TokenErrorResponse {
                error: format!("http_{}", status.as_u16()),
                error_description: body.chars().take(200).collect(),
            });
        Err(Attempt::Fail(AuthError::Rejected {
            error: rejection.error,
            description: rejection.error_description,
        }))
    }
}

enum Attempt {
    Retry(String),
    Fail(AuthError),
}

/// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
/// never more than `max`.
pub(crate) fn fetch_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    async fn fetch(&self) -> Result<Credential, AuthError> {
        if self.credentials.client_secret.is_empty() {
            return Err(AuthError::MissingSetting("client_secret"));
        }
        let url = self.credentials.token_url();
        let scope = self.credentials.scope();
        let mut last = String::new();

        for attempt in 1..=self.max_attempts {
            debug!(attempt, scope = %scope, "requesting access token");
            match self.attempt(&url, &scope).await {
                Ok(credential) => return Ok(credential),
                Err(Attempt::Fail(e)) => return Err(e),
                Err(Attempt::Retry(detail)) => {
                    warn!(attempt, max = self.max_attempts, %detail, "token request failed");
                    last = detail;
                    if attempt < self.max_attempts {
                        tokio::time::sleep(fetch_backoff(self.base_delay, self.max_delay, attempt)).await;
                    }
                }
            }
        }

        Err(AuthError::Unreachable {
            attempts: self.max_attempts,
            detail: last,
        })
    }
}

// ─── CredentialManager ────────────────────────────────────────────────────

/// Process-wide token cache.
///
/// Readers share a read lock on the cached credential. Fetching happens
/// under a separate mutex and re-checks the cache once acquired, so callers
/// that queue up behind a refresh get its result instead of fetching again.
pub struct CredentialManager {
    source: Arc<dyn TokenSource>,
    cached: RwLock<Option<Arc<Credential>>>,
    refresh: Mutex<()>,
    safety_margin: chrono::Duration,
}

impl CredentialManager {
    pub fn new(source: Arc<dyn TokenSource>, safety_margin: Duration) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
            safety_margin: chrono::Duration::from_std(safety_margin)
                .unwrap_or(chrono::Duration::zero()),
        }
    }

    /// A bearer token with at least the safety margin of lifetime left.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.valid_cached().await {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        if let Some(token) = self.valid_cached().await {
            return Ok(token);
        }
        self.fetch_and_store().await
    }

    /// Replace a token the server rejected.
    ///
    /// If another caller already swapped `stale` out, its replacement is
    /// returned without a new fetch.
    pub async fn force_refresh(&self, stale: &str) -> Result<String, AuthError> {
        let _guard = self.refresh.lock().await;
        if let Some(current) = self.cached.read().await.as_ref() {
            if current.access_token() != stale
                && current.is_valid_at(Utc::now(), self.safety_margin)
            {
                return Ok(current.access_token().to_string());
            }
        }
        self.fetch_and_store().await
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    /// The cached credential, valid or not.
    pub async fn current(&self) -> Option<Arc<Credential>> {
        self.cached.read().await.clone()
    }

    async fn valid_cached(&self) -> Option<String> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| c.is_valid_at(Utc::now(), self.safety_margin))
            .map(|c| c.access_token().to_string())
    }

    async fn fetch_and_store(&self) -> Result<String, AuthError> {
        match self.source.fetch().await {
            Ok(credential) => {
                info!(expires_at = %credential.expires_at(), "access token acquired");
                let token = credential.access_token().to_string();
                *self.cached.write().await = Some(Arc::new(credential));
                Ok(token)
            }
            Err(e) => {
                error!(error = %e, "access token request failed");
                *self.cached.write().await = None;
                Err(e)
            }
        }
    }
}
