//! Retrying operations with exponential backoff and jitter.
//!
//! The [`RetryPolicy`] struct defines the configuration for retry behavior:
//! the maximum number of retries, initial delay, maximum delay, and jitter.
//!
//! [`retry_with_exponential_backoff`] runs a fallible operation under a
//! policy, sleeping between attempts. The sleeps are interruptible through
//! a [`CancelToken`] so a shutting-down worker is not held hostage by a
//! long backoff schedule.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// Configuration for retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: usize,
    /// Initial delay in milliseconds before the first retry.
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds between retries.
    pub max_delay_ms: u64,
    /// Maximum jitter in milliseconds to add to the delay.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1600,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, used for final best-effort drains.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        }
    }
}

/// A token used to interrupt backoff sleeps when shutdown begins.
#[derive(Debug, Default)]
pub(crate) struct CancelToken {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        CancelToken::default()
    }

    /// Wakes every in-progress [`CancelToken::wait`] and makes future waits
    /// return immediately.
    pub(crate) fn cancel(&self) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            *cancelled = true;
            self.condvar.notify_all();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `true` if the
    /// wait was cut short by cancellation.
    pub(crate) fn wait(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        let Ok(mut cancelled) = self.cancelled.lock() else {
            return true;
        };
        while !*cancelled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            match self.condvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return true,
            }
        }
        true
    }
}

// Generates a random jitter value up to max_jitter
fn generate_jitter(max_jitter: u64) -> u64 {
    let now = SystemTime::now();
    let nanos = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    nanos as u64 % (max_jitter + 1)
}

/// Retries the given operation with exponential backoff and jitter.
///
/// The operation is attempted once plus up to `policy.max_retries` further
/// times. Between attempts the worker sleeps for an exponentially growing
/// delay, capped at `max_delay_ms`, plus a random jitter. If `cancel` fires
/// during a sleep the last error is returned immediately.
pub(crate) fn retry_with_exponential_backoff<F, T, E>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Debug,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay_ms;

    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(err) if attempt < policy.max_retries && !cancel.is_cancelled() => {
                attempt += 1;
                warn!(
                    name: "telemetry.export.retry",
                    operation = operation_name,
                    attempt,
                    error = ?err,
                    "retrying after transient failure"
                );
                let jitter = generate_jitter(policy.jitter_ms);
                let delay_with_jitter = std::cmp::min(delay + jitter, policy.max_delay_ms);
                if cancel.wait(Duration::from_millis(delay_with_jitter)) {
                    return Err(err);
                }
                delay = std::cmp::min(delay.saturating_mul(2), policy.max_delay_ms);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_generate_jitter() {
        let max_jitter = 100;
        let jitter = generate_jitter(max_jitter);
        assert!(jitter <= max_jitter);
    }

    #[test]
    fn succeeds_on_first_attempt() {
        let policy = RetryPolicy::default();
        let cancel = CancelToken::new();
        let result =
            retry_with_exponential_backoff(&policy, &cancel, "test_operation", || {
                Ok::<_, ()>("success")
            });
        assert_eq!(result, Ok("success"));
    }

    #[test]
    fn retries_until_success() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            jitter_ms: 1,
        };
        let cancel = CancelToken::new();
        let attempts = AtomicUsize::new(0);

        let result = retry_with_exponential_backoff(&policy, &cancel, "test_operation", || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err::<&str, &str>("error")
            } else {
                Ok::<&str, &str>("success")
            }
        });

        assert_eq!(result, Ok("success"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fails_after_max_retries() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            jitter_ms: 1,
        };
        let cancel = CancelToken::new();
        let attempts = AtomicUsize::new(0);

        let result = retry_with_exponential_backoff(&policy, &cancel, "test_operation", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("error")
        });

        assert_eq!(result, Err("error"));
        // initial attempt + 3 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn no_retry_policy_attempts_once() {
        let policy = RetryPolicy::no_retry();
        let cancel = CancelToken::new();
        let attempts = AtomicUsize::new(0);

        let result = retry_with_exponential_backoff(&policy, &cancel, "test_operation", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("error")
        });

        assert_eq!(result, Err("error"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay_ms: 5_000,
            max_delay_ms: 5_000,
            jitter_ms: 0,
        };
        let cancel = Arc::new(CancelToken::new());

        let canceller = Arc::clone(&cancel);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let start = Instant::now();
        let result = retry_with_exponential_backoff(&policy, &cancel, "test_operation", || {
            Err::<(), _>("error")
        });
        handle.join().unwrap();

        assert_eq!(result, Err("error"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
