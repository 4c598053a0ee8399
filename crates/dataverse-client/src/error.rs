use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── ErrorKind ────────────────────────────────────────────────────────────

/// Coarse classification of a failed Web API call.
///
/// The orchestrator's retry policy is driven entirely by this value; see
/// [`crate::classify`] for the mapping from status codes and Dataverse error
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401: the bearer token was rejected.
    Unauthorized,
    /// Service protection limit hit (429, or 503 with a throttling code).
    Throttled,
    /// Network failure, timeout, or a 5xx the platform expects callers to retry.
    Transient,
    /// Business-rule rejection: already merged, locked, concurrency mismatch.
    Conflict,
    /// Request rejected as invalid (400 class).
    Validation,
    /// Caller lacks the privilege for the operation.
    Forbidden,
    /// Target record or entity set does not exist.
    NotFound,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Other => "other",
        }
    }

    /// Whether repeating the identical request can succeed without any
    /// caller-side change. `Unauthorized` is excluded: it needs a new token.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Throttled | ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── GatewayError ─────────────────────────────────────────────────────────

/// Structured failure returned by every [`crate::Gateway`] call.
#[derive(Debug, Clone, PartialEq, Error)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// HTTP status, absent for transport failures.
    pub status: Option<u16>,
    /// Dataverse error code as reported (e.g. `0x80072322`).
    pub code: Option<String>,
    pub detail: String,
    /// Server-provided `Retry-After`, only meaningful for `Throttled`.
    pub retry_after: Option<Duration>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            status: None,
            code: None,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail).with_status(401)
    }

    pub fn throttled(retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(ErrorKind::Throttled, "service protection limit exceeded")
            .with_status(429);
        err.retry_after = retry_after;
        err
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        match (self.status, self.code.as_deref()) {
            (Some(status), Some(code)) => write!(f, " (HTTP {status}, {code})")?,
            (Some(status), None) => write!(f, " (HTTP {status})")?,
            (None, Some(code)) => write!(f, " ({code})")?,
            (None, None) => {}
        }
        write!(f, ": {}", self.detail)
    }
}

// ─── AuthError ────────────────────────────────────────────────────────────

/// Failure to obtain an access token. Unrecoverable for a batch run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("identity provider rejected the client credentials: {error}: {description}")]
    Rejected { error: String, description: String },

    #[error("token endpoint unreachable after {attempts} attempt(s): {detail}")]
    Unreachable { attempts: u32, detail: String },

    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    #[error("missing credential setting: {0}")]
    MissingSetting(&'static str),
}

// ─── DataverseError ───────────────────────────────────────────────────────

/// Crate-level error for setup paths (client construction, id parsing).
#[derive(Debug, Error)]
pub enum DataverseError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid record id '{0}': expected a GUID")]
    InvalidRecordId(String),

    #[error("invalid gateway configuration: {0}")]
    Config(String),
}
