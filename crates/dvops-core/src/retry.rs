//! Retry policy, the shared throttle gate, and the [`Caller`] that applies
//! both around every gateway call.
//!
//! # Failure handling per call
//!
//! ```text
//! Unauthorized  → force_refresh(stale token), retry once, then Unauthorized
//! Throttled     → engage gate for Retry-After (or backoff) + jitter,
//!                 retry up to throttle_attempts, then RateLimited
//! Transient     → sleep backoff, retry up to max_attempts total, then Exhausted
//! anything else → Rejected, no retry
//! ```
//!
//! A token that cannot be obtained at all surfaces as [`CallFailure::Fatal`].

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dataverse_client::{AuthError, CredentialManager, ErrorKind, GatewayError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts for transient failures, first attempt included.
    pub max_attempts: u32,
    /// Retries allowed after throttling responses.
    pub throttle_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            throttle_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base, …
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// ThrottleGate
// ---------------------------------------------------------------------------

/// Process-wide pause shared by every worker.
///
/// A throttled call pushes the resume instant out; every call waits for it
/// before going to the network, so one 429 slows the whole pool rather than
/// only the row that saw it.
#[derive(Debug)]
pub struct ThrottleGate {
    resume_at: Mutex<Option<Instant>>,
    max_jitter: Duration,
}

impl ThrottleGate {
    pub fn new(max_jitter: Duration) -> Self {
        Self {
            resume_at: Mutex::new(None),
            max_jitter,
        }
    }

    fn jitter(&self) -> Duration {
        let ms = self.max_jitter.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
    }

    /// Pause all callers for at least `delay`. Never shortens an existing pause.
    pub fn engage(&self, delay: Duration) {
        let until = Instant::now() + delay + self.jitter();
        let mut resume_at = self.resume_at.lock().unwrap_or_else(|e| e.into_inner());
        if resume_at.map_or(true, |current| until > current) {
            *resume_at = Some(until);
        }
    }

    /// The instant callers are paused until, if it is still in the future.
    pub fn paused_until(&self) -> Option<Instant> {
        let resume_at = *self.resume_at.lock().unwrap_or_else(|e| e.into_inner());
        resume_at.filter(|t| *t > Instant::now())
    }

    pub async fn wait(&self) {
        let mut waited = false;
        while let Some(until) = self.paused_until() {
            tokio::time::sleep_until(until).await;
            waited = true;
        }
        // spread the wake-ups of callers released by the same pause
        if waited {
            let spread = self.jitter();
            if !spread.is_zero() {
                tokio::time::sleep(spread).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// Why a call gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// No token could be obtained. Ends the run.
    Fatal(AuthError),
    /// Still throttled after the configured retries.
    RateLimited(GatewayError),
    /// Rejected again after a forced token refresh.
    Unauthorized(GatewayError),
    /// Transient failures on every attempt.
    Exhausted(GatewayError),
    /// Non-retryable rejection (conflict, validation, forbidden, not found).
    Rejected(GatewayError),
}

impl CallFailure {
    pub fn detail(&self) -> String {
        match self {
            CallFailure::Fatal(e) => e.to_string(),
            CallFailure::RateLimited(e)
            | CallFailure::Unauthorized(e)
            | CallFailure::Exhausted(e)
            | CallFailure::Rejected(e) => e.to_string(),
        }
    }
}

/// Result of [`Caller::call`] plus how many times the operation was sent.
#[derive(Debug)]
pub struct CallReport<T> {
    pub result: Result<T, CallFailure>,
    pub attempts: u32,
}

impl<T> CallReport<T> {
    fn done(result: Result<T, CallFailure>, attempts: u32) -> Self {
        Self { result, attempts }
    }
}

/// Token, throttle gate and retry policy applied around one gateway call.
pub struct Caller {
    credentials: Arc<CredentialManager>,
    gate: Arc<ThrottleGate>,
    policy: RetryPolicy,
}

impl Caller {
    pub fn new(
        credentials: Arc<CredentialManager>,
        gate: Arc<ThrottleGate>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            credentials,
            gate,
            policy,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn gate(&self) -> &Arc<ThrottleGate> {
        &self.gate
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` with a bearer token until it succeeds or the policy gives up.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> CallReport<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut token = match self.credentials.get_token().await {
            Ok(t) => t,
            Err(e) => return CallReport::done(Err(CallFailure::Fatal(e)), 0),
        };

        let mut attempts = 0u32;
        let mut refreshed = false;
        let mut transient_failures = 0u32;
        let mut throttled = 0u32;

        loop {
            self.gate.wait().await;
            attempts += 1;
            debug!(call = what, attempt = attempts, "dispatch");

            let err = match op(token.clone()).await {
                Ok(value) => return CallReport::done(Ok(value), attempts),
                Err(e) => e,
            };

            match err.kind {
                ErrorKind::Unauthorized if !refreshed => {
                    warn!(call = what, "token rejected, refreshing");
                    refreshed = true;
                    token = match self.credentials.force_refresh(&token).await {
                        Ok(t) => t,
                        Err(e) => return CallReport::done(Err(CallFailure::Fatal(e)), attempts),
                    };
                }
                ErrorKind::Unauthorized => {
                    return CallReport::done(Err(CallFailure::Unauthorized(err)), attempts);
                }
                ErrorKind::Throttled => {
                    if throttled >= self.policy.throttle_attempts {
                        warn!(call = what, attempts, "still throttled, giving up");
                        return CallReport::done(Err(CallFailure::RateLimited(err)), attempts);
                    }
                    throttled += 1;
                    let delay = err
                        .retry_after
                        .unwrap_or_else(|| self.policy.backoff(throttled))
                        .min(self.policy.max_delay);
                    warn!(call = what, retry = throttled, delay_ms = delay.as_millis() as u64, "throttled");
                    self.gate.engage(delay);
                }
                ErrorKind::Transient => {
                    transient_failures += 1;
                    if transient_failures >= self.policy.max_attempts {
                        warn!(call = what, attempts, error = %err, "giving up after transient failures");
                        return CallReport::done(Err(CallFailure::Exhausted(err)), attempts);
                    }
                    let delay = self.policy.backoff(transient_failures);
                    warn!(call = what, retry = transient_failures, delay_ms = delay.as_millis() as u64, error = %err, "transient failure");
                    tokio::time::sleep(delay).await;
                }
                _ => return CallReport::done(Err(CallFailure::Rejected(err)), attempts),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_policy, FakeTokenSource};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn caller(source: Arc<FakeTokenSource>, policy: RetryPolicy) -> Caller {
        let manager = Arc::new(CredentialManager::new(source, Duration::ZERO));
        Caller::new(manager, Arc::new(ThrottleGate::new(Duration::ZERO)), policy)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn gate_pauses_until_resume_instant() {
        let gate = ThrottleGate::new(Duration::ZERO);
        assert!(gate.paused_until().is_none());

        gate.engage(Duration::from_millis(30));
        assert!(gate.paused_until().is_some());
        // a shorter pause never pulls the resume instant in
        let long = gate.paused_until().unwrap();
        gate.engage(Duration::from_millis(1));
        assert_eq!(gate.paused_until(), Some(long));

        let start = Instant::now();
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(gate.paused_until().is_none());
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let source = Arc::new(FakeTokenSource::new());
        let report = caller(source.clone(), fast_policy())
            .call("whoami", |token| async move { Ok::<_, GatewayError>(token) })
            .await;
        assert_eq!(report.result.unwrap(), "token-1");
        assert_eq!(report.attempts, 1);
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn throttled_retries_up_to_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = fast_policy();
        policy.throttle_attempts = 3;
        let c = calls.clone();
        let report = caller(Arc::new(FakeTokenSource::new()), policy)
            .call("merge", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(GatewayError::throttled(Some(Duration::from_millis(1)))) }
            })
            .await;
        assert!(matches!(report.result, Err(CallFailure::RateLimited(_))));
        assert_eq!(report.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn transient_gives_up_after_max_attempts() {
        let mut policy = fast_policy();
        policy.max_attempts = 3;
        let report = caller(Arc::new(FakeTokenSource::new()), policy)
            .call("query", |_| async {
                Err::<(), _>(GatewayError::transient("connection reset"))
            })
            .await;
        assert!(matches!(report.result, Err(CallFailure::Exhausted(_))));
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let report = caller(Arc::new(FakeTokenSource::new()), fast_policy())
            .call("query", move |_| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(GatewayError::transient("timed out"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(report.result.unwrap(), 1);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn conflict_is_not_retried() {
        let report = caller(Arc::new(FakeTokenSource::new()), fast_policy())
            .call("merge", |_| async {
                Err::<(), _>(GatewayError::conflict("already merged"))
            })
            .await;
        assert!(matches!(report.result, Err(CallFailure::Rejected(_))));
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once() {
        let source = Arc::new(FakeTokenSource::new());
        let report = caller(source.clone(), fast_policy())
            .call("update", |token| async move {
                if token == "token-1" {
                    Err(GatewayError::unauthorized("expired"))
                } else {
                    Ok(token)
                }
            })
            .await;
        assert_eq!(report.result.unwrap(), "token-2");
        assert_eq!(report.attempts, 2);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn persistent_unauthorized_fails_row() {
        let source = Arc::new(FakeTokenSource::new());
        let report = caller(source.clone(), fast_policy())
            .call("update", |_| async {
                Err::<(), _>(GatewayError::unauthorized("nope"))
            })
            .await;
        assert!(matches!(report.result, Err(CallFailure::Unauthorized(_))));
        assert_eq!(report.attempts, 2);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh_at_expiry() {
        let source = Arc::new(
            FakeTokenSource::new()
                .with_expires_in(Duration::from_millis(150))
                .with_delay(Duration::from_millis(20)),
        );
        let manager = Arc::new(CredentialManager::new(source.clone(), Duration::ZERO));
        assert_eq!(manager.get_token().await.unwrap(), "token-1");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let tokens = futures::future::join_all((0..16).map(|_| {
            let manager = manager.clone();
            async move { manager.get_token().await.unwrap() }
        }))
        .await;

        assert_eq!(source.fetches(), 2);
        assert!(tokens.iter().all(|t| t == "token-2"));
    }

    #[tokio::test]
    async fn missing_token_is_fatal() {
        let source = Arc::new(FakeTokenSource::failing());
        let report = caller(source, fast_policy())
            .call("query", |_| async { Ok::<_, GatewayError>(()) })
            .await;
        assert!(matches!(report.result, Err(CallFailure::Fatal(_))));
        assert_eq!(report.attempts, 0);
    }
}
