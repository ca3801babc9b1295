//! Backoff-and-retry wrapper for remote generation calls.
//!
//! Only quota exhaustion is worth waiting out. Everything else goes straight
//! back to the caller untouched.

use crate::config::RetrySettings;
use crate::error::BackendError;
use crate::events::{RetryBus, RetryNotice};
use crate::logr;
use std::future::Future;
use std::time::Duration;

/// What the retrying caller should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Rate/usage limit hit; `retry_after` is the server's hint, if any.
    Quota { retry_after: Option<Duration> },
    Fatal,
}

/// Failures the retrying caller knows how to classify and wrap.
pub trait Retryable: Sized {
    fn disposition(&self) -> Disposition;

    /// Error surfaced once the attempt budget is spent; `last` is the final
    /// quota failure.
    fn exhausted(call_id: &str, attempts: u32, last: Self) -> Self;
}

impl Retryable for BackendError {
    fn disposition(&self) -> Disposition {
        if self.is_quota_exhausted() {
            Disposition::Quota {
                retry_after: self.retry_hint(),
            }
        } else {
            Disposition::Fatal
        }
    }

    fn exhausted(call_id: &str, attempts: u32, last: Self) -> Self {
        BackendError::RetriesExhausted {
            call_id: call_id.to_string(),
            attempts,
            source: Box::new(last),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Added on top of a server-suggested delay.
    pub safety_margin: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            safety_margin: Duration::from_millis(settings.safety_margin_ms),
        }
    }
}

impl RetryPolicy {
    /// Wait before retrying after the failure of 0-based attempt `attempt`.
    pub fn wait_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if !hint.is_zero() => hint.saturating_add(self.safety_margin),
            _ => self.backoff(attempt),
        }
    }

    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs remote operations, waiting out quota failures and announcing every
/// scheduled retry on a [`RetryBus`].
#[derive(Clone)]
pub struct RetryingCaller {
    policy: RetryPolicy,
    bus: RetryBus,
}

impl RetryingCaller {
    pub fn new(policy: RetryPolicy, bus: RetryBus) -> Self {
        Self { policy, bus }
    }

    /// [`execute_with`](Self::execute_with) using the policy's attempt bound.
    pub async fn execute<T, E, F, Fut>(&self, call_id: &str, operation: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(call_id, self.policy.max_attempts, operation)
            .await
    }

    /// Runs `operation` up to `max_attempts` times.
    ///
    /// Fatal failures return immediately and unchanged. Quota failures sleep
    /// and retry; if the last permitted attempt also hits the quota, the
    /// result is [`Retryable::exhausted`] wrapping that final failure.
    /// `call_id` only labels log lines and notices.
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        call_id: &str,
        max_attempts: u32,
        mut operation: F,
    ) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retry_after = match err.disposition() {
                Disposition::Fatal => return Err(err),
                Disposition::Quota { retry_after } => retry_after,
            };

            if attempt + 1 >= max_attempts {
                tracing::warn!(call_id, attempts = max_attempts, "retry budget exhausted");
                return Err(E::exhausted(call_id, max_attempts, err));
            }

            let wait = self.policy.wait_for(attempt, retry_after);
            tracing::debug!(
                call_id,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                server_hint = retry_after.is_some(),
                "quota exhausted, backing off",
            );
            logr(format!(
                "Quota reached for [{}]. Backing off for {}s...",
                call_id,
                wait.as_millis().div_ceil(1000)
            ));

            self.bus.publish(&RetryNotice {
                call_id: call_id.to_string(),
                wait,
                attempt: attempt + 1,
            });

            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn quota() -> BackendError {
        BackendError::Api(ApiError::new("Resource has been exhausted").with_code(429))
    }

    fn caller_with_log() -> (RetryingCaller, Arc<Mutex<Vec<RetryNotice>>>, crate::events::RetrySubscription) {
        let bus = RetryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(move |n| sink.lock().unwrap().push(n.clone()));
        (RetryingCaller::new(RetryPolicy::default(), bus), seen, sub)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let expected = [5, 10, 20, 40, 60, 60, 60];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(policy.wait_for(i as u32, None), Duration::from_secs(*secs));
        }
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn server_hint_gets_safety_margin() {
        let policy = RetryPolicy::default();
        let hint = Duration::from_millis(12_500);
        assert_eq!(policy.wait_for(7, Some(hint)), Duration::from_millis(14_500));
    }

    #[test]
    fn text_hint_flows_into_wait() {
        let err = BackendError::Api(ApiError::from_message(
            "Quota exceeded for metric generate_requests. Please retry in 12.5s.",
        ));
        let Disposition::Quota { retry_after } = err.disposition() else {
            panic!("expected quota disposition");
        };
        let wait = RetryPolicy::default().wait_for(0, retry_after);
        assert_eq!(wait.as_millis(), 12_500 + 2_000);
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        let err = BackendError::Api(ApiError::new("Invalid API key").with_code(400));
        assert_eq!(err.disposition(), Disposition::Fatal);
        assert_eq!(BackendError::MissingOutput("audio").disposition(), Disposition::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_without_notices() {
        let (caller, seen, _sub) = caller_with_log();
        let out: Result<u32, BackendError> = caller.execute("voice-1", || async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_then_success_waits_backoff() {
        let (caller, seen, _sub) = caller_with_log();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let out = caller
            .execute("keyframe-1", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(quota()) } else { Ok("png") } }
            })
            .await;

        assert_eq!(out.unwrap(), "png");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(5 + 10));

        let seen = seen.lock().unwrap();
        let waits: Vec<u64> = seen.iter().map(RetryNotice::wait_ms).collect();
        assert_eq!(waits, vec![5_000, 10_000]);
        assert!(seen.iter().all(|n| n.call_id == "keyframe-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_propagates_immediately() {
        let (caller, seen, _sub) = caller_with_log();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = caller
            .execute("video-1", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackendError::Api(ApiError::new("bad request").with_code(400))) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Api(ref api) if api.code == Some(400)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_failure() {
        let (caller, seen, _sub) = caller_with_log();
        let calls = AtomicU32::new(0);

        let err = caller
            .execute_with("script-gen", 4, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(quota()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(seen.lock().unwrap().len(), 3);
        match err {
            BackendError::RetriesExhausted { call_id, attempts, source } => {
                assert_eq!(call_id, "script-gen");
                assert_eq!(attempts, 4);
                assert!(source.is_quota_exhausted());
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn default_budget_notifies_nine_times() {
        let (caller, seen, _sub) = caller_with_log();
        let err = caller
            .execute("voice-9", || async { Err::<(), _>(quota()) })
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::RetriesExhausted { attempts: 10, .. }));
        assert_eq!(seen.lock().unwrap().len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_on_last_attempt_is_not_wrapped() {
        let (caller, _seen, _sub) = caller_with_log();
        let calls = AtomicU32::new(0);

        let err = caller
            .execute_with("video-2", 2, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err::<(), _>(quota())
                    } else {
                        Err(BackendError::MissingOutput("video"))
                    }
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::MissingOutput("video")));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_observer_misses_later_retries() {
        let bus = RetryBus::new();
        let caller = RetryingCaller::new(RetryPolicy::default(), bus.clone());
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&hits);
        let sub = Arc::new(bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let calls = AtomicU32::new(0);
        let handle = Arc::clone(&sub);
        let out = caller
            .execute("voice-3", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                // drop out after the first retry has been announced
                if n == 1 {
                    handle.unsubscribe();
                }
                async move { if n < 3 { Err(quota()) } else { Ok(()) } }
            })
            .await;

        assert!(out.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
