//! Shared error policy for pull-consumer loops.
//!
//! Two failure modes from the stream contract are handled here:
//!
//! - **stream not found at startup** — transient; retried with exponential
//!   backoff up to a bounded attempt count, then surfaced loudly;
//! - **service unavailable during fetch** — counted; after a threshold of
//!   consecutive errors the caller must perform a full connection reset,
//!   backing off exponentially (2s, 4s, 8s, …) between resets.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::BusError;

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Run `op` until it succeeds, retrying `StreamNotFound` with backoff.
///
/// Any other error, or exhausting `max_attempts`, is returned to the caller
/// so startup fails loudly rather than spinning forever.
pub async fn bind_with_retry<T, F, Fut>(
    mut op: F,
    max_attempts: u32,
    backoff: BackoffPolicy,
) -> Result<T, BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(BusError::StreamNotFound(name)) if attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    stream = %name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "stream not found, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// What a fetch loop should do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Below the threshold: keep fetching.
    Continue,
    /// Threshold reached: tear down and rebuild the connection after
    /// sleeping for the given backoff.
    Reset(Duration),
}

/// Tracks consecutive fetch errors and decides when to reset.
#[derive(Debug)]
pub struct FetchErrorPolicy {
    threshold: u32,
    consecutive: u32,
    resets: u32,
    backoff: BackoffPolicy,
}

impl FetchErrorPolicy {
    pub fn new(threshold: u32, backoff: BackoffPolicy) -> Self {
        FetchErrorPolicy {
            threshold: threshold.max(1),
            consecutive: 0,
            resets: 0,
            backoff,
        }
    }

    /// A successful fetch clears both the error streak and the reset ladder.
    pub fn on_success(&mut self) {
        self.consecutive = 0;
        self.resets = 0;
    }

    pub fn on_error(&mut self) -> ErrorAction {
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            let delay = self.backoff.delay(self.resets);
            self.resets = self.resets.saturating_add(1);
            ErrorAction::Reset(delay)
        } else {
            ErrorAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(8),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn bind_retries_not_found_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = bind_with_retry(
            {
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(BusError::StreamNotFound("events".to_owned()))
                        } else {
                            Ok(42u32)
                        }
                    }
                }
            },
            10,
            fast_backoff(),
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bind_fails_loudly_after_the_attempt_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), BusError> = bind_with_retry(
            {
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(BusError::StreamNotFound("events".to_owned()))
                    }
                }
            },
            3,
            fast_backoff(),
        )
        .await;
        assert_eq!(result, Err(BusError::StreamNotFound("events".to_owned())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn third_consecutive_error_triggers_a_reset() {
        let mut policy = FetchErrorPolicy::new(3, fast_backoff());
        assert_eq!(policy.on_error(), ErrorAction::Continue);
        assert_eq!(policy.on_error(), ErrorAction::Continue);
        assert_eq!(
            policy.on_error(),
            ErrorAction::Reset(Duration::from_millis(1))
        );
    }

    #[test]
    fn reset_backoff_escalates_across_resets() {
        let mut policy = FetchErrorPolicy::new(1, fast_backoff());
        assert_eq!(policy.on_error(), ErrorAction::Reset(Duration::from_millis(1)));
        assert_eq!(policy.on_error(), ErrorAction::Reset(Duration::from_millis(2)));
        assert_eq!(policy.on_error(), ErrorAction::Reset(Duration::from_millis(4)));
    }

    #[test]
    fn success_clears_the_streak_and_the_ladder() {
        let mut policy = FetchErrorPolicy::new(2, fast_backoff());
        assert_eq!(policy.on_error(), ErrorAction::Continue);
        policy.on_success();
        assert_eq!(policy.on_error(), ErrorAction::Continue);
        assert_eq!(
            policy.on_error(),
            ErrorAction::Reset(Duration::from_millis(1))
        );
        policy.on_success();
        // Ladder reset too: next reset starts back at the base delay.
        assert_eq!(policy.on_error(), ErrorAction::Continue);
        assert_eq!(
            policy.on_error(),
            ErrorAction::Reset(Duration::from_millis(1))
        );
    }
}
