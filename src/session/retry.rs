//! Exponential backoff retry policy.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::error::CoordError;
use crate::Result;

/// Exponential backoff with a bounded number of retries.
///
/// The n-th retry (0-based) waits `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Number of retries after the initial attempt.
    pub max_retries: u32,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_retries: 3,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff starting at `base_delay` for `max_retries` retries.
    pub fn exponential(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Override the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent.
    ///
    /// The backoff sleep is abandoned as soon as `shutdown` flips to `true`,
    /// in which case [`CoordError::SessionClosed`] is returned.
    pub async fn run<F, Fut, T>(
        &self,
        label: &str,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            if *shutdown.borrow() {
                return Err(CoordError::SessionClosed);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        label,
                        e,
                        retry + 1,
                        self.max_retries,
                        delay
                    );
                    retry += 1;
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return Err(CoordError::SessionClosed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `false` if shutdown won.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            // Sender gone: nobody can signal shutdown any more.
            Err(_) => {
                tokio::time::sleep(delay).await;
                true
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(1), max_retries)
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), 10)
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = fast(5)
            .run("op", &mut rx, || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CoordError::ConnectionLoss)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<()> = fast(2)
            .run("op", &mut rx, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CoordError::ConnectionLoss) }
            })
            .await;

        assert!(matches!(result, Err(CoordError::ConnectionLoss)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_logic_errors_are_not_retried() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<()> = fast(5)
            .run("op", &mut rx, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CoordError::NodeExists("/a".into())) }
            })
            .await;

        assert!(matches!(result, Err(CoordError::NodeExists(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let (tx, mut rx) = watch::channel(false);
        let policy = RetryPolicy::exponential(Duration::from_secs(30), 5);

        let handle = tokio::spawn(async move {
            policy
                .run("op", &mut rx, || async { Err::<(), _>(CoordError::ConnectionLoss) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("retry loop should stop promptly")
            .unwrap();
        assert!(matches!(result, Err(CoordError::SessionClosed)));
    }
}
