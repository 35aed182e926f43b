//! Retry with exponential backoff for transient chain errors
//!
//! Only errors raised before anything was broadcast are retried; an in-doubt
//! transaction is returned to the caller as is.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::chain::ChainError;

/// Exponential backoff with jitter.
///
/// Delay for attempt `n` is `min(base * factor^n, max)` scaled by a random
/// factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            base,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let multiplier = self.factor.powi(self.attempt as i32);
        let delay = self.base.mul_f64(multiplier).min(self.max);
        self.attempt += 1;

        if self.jitter <= 0.0 {
            return delay;
        }
        let spread: f64 = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// 500ms doubling to 10s, ±20%
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10), 2.0, 0.2)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Retry policy with no waiting, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO, 1.0, 0.0),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut backoff = self.backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    log::warn!(
                        "[Refund] {} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300), 2.0, 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.attempt(), 3);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 1.0, 0.1);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(90));
            assert!(delay <= Duration::from_millis(110));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("read", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ChainError::Transport("reset".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("transfer", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChainError::InsufficientFunds("gas".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_transaction_not_resent() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, _> = RetryPolicy::immediate(4)
            .run("refund", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ChainError::Timeout {
                        tx_hash: Some("0xaa".to_string()),
                    })
                } else {
                    Ok("0xbb")
                }
            })
            .await;
        assert!(result.unwrap_err().is_in_doubt());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(2)
            .run("read", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChainError::Transport("down".to_string()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
