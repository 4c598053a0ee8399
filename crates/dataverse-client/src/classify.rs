//! Mapping from Web API failure signals to [`ErrorKind`].
//!
//! Dataverse reports most business errors as HTTP 400 with a numeric code in
//! the OData error body, so the code is checked before the status. Codes are
//! compared numerically: the service sends them as `0x8007xxxx` hex strings,
//! older endpoints as signed decimals.

use std::time::Duration;

use crate::error::{ErrorKind, GatewayError};

pub const SERVICE_PROTECTION_REQUESTS: u32 = 0x8007_2322;
pub const SERVICE_PROTECTION_EXECUTION_TIME: u32 = 0x8007_2321;
pub const SERVICE_PROTECTION_CONCURRENCY: u32 = 0x8007_2326;
pub const DUPLICATE_RECORD: u32 = 0x8004_0237;
pub const CONCURRENCY_VERSION_MISMATCH: u32 = 0x8006_0891;
pub const PLUGIN_ABORTED: u32 = 0x8004_0265;
pub const PRIVILEGE_DENIED: u32 = 0x8004_0220;
pub const OBJECT_DOES_NOT_EXIST: u32 = 0x8004_0217;

/// Parse a Dataverse error code in either hex (`0x80040217`) or signed
/// decimal (`-2147220969`) form.
pub fn parse_code(code: &str) -> Option<u32> {
    let code = code.trim();
    if let Some(hex) = code
        .strip_prefix("0x")
        .or_else(|| code.strip_prefix("0X"))
    {
        return u32::from_str_radix(hex, 16).ok();
    }
    code.parse::<i64>().ok().map(|n| n as u32)
}

/// Classify a failed response.
pub fn classify(
    status: u16,
    code: Option<&str>,
    message: &str,
    retry_after: Option<Duration>,
) -> GatewayError {
    let kind = kind_for(status, code.and_then(parse_code), message);
    let mut err = GatewayError::new(kind, message_or_status(message, status)).with_status(status);
    if let Some(code) = code {
        err = err.with_code(code);
    }
    if kind == ErrorKind::Throttled {
        err.retry_after = retry_after;
    }
    err
}

fn kind_for(status: u16, code: Option<u32>, message: &str) -> ErrorKind {
    if status == 401 {
        return ErrorKind::Unauthorized;
    }

    match code {
        Some(
            SERVICE_PROTECTION_REQUESTS
            | SERVICE_PROTECTION_EXECUTION_TIME
            | SERVICE_PROTECTION_CONCURRENCY,
        ) if status == 429 || status == 503 => return ErrorKind::Throttled,
        Some(DUPLICATE_RECORD | CONCURRENCY_VERSION_MISMATCH | PLUGIN_ABORTED) => {
            return ErrorKind::Conflict
        }
        Some(PRIVILEGE_DENIED) => return ErrorKind::Forbidden,
        Some(OBJECT_DOES_NOT_EXIST) => return ErrorKind::NotFound,
        _ => {}
    }

    if status == 429 {
        return ErrorKind::Throttled;
    }
    if is_conflict_message(message) {
        return ErrorKind::Conflict;
    }

    match status {
        408 | 500 | 502 | 503 | 504 => ErrorKind::Transient,
        409 | 412 => ErrorKind::Conflict,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        400..=499 => ErrorKind::Validation,
        _ => ErrorKind::Other,
    }
}

fn is_conflict_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("already merged") || lower.contains("is locked")
}

fn message_or_status(message: &str, status: u16) -> String {
    if message.trim().is_empty() {
        format!("request failed with HTTP {status}")
    } else {
        message.to_string()
    }
}
