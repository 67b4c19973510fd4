//! Exponential backoff retry around a [`Shipper`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::entry::Entry;
use crate::error::ParcelError;
use crate::shipper::Shipper;

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Computes the delay before each retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry (1-based), or `None` once retries are spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms =
            self.config.initial_backoff.as_millis() as f64 * self.config.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.config.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(capped_ms.max(0.0).round() as u64))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.config.max_retries
    }
}

/// Re-ships a parcel while the inner shipper reports [`ParcelError::Transient`].
///
/// Every attempt sees the whole parcel. Entries resolved by an earlier
/// attempt keep their first result.
pub struct RetryingShipper<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingShipper<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self {
            inner,
            policy: RetryPolicy::new(config),
        }
    }
}

#[async_trait]
impl<P, R, S> Shipper<P, R> for RetryingShipper<S>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    S: Shipper<P, R>,
{
    async fn ship(
        &self,
        parcel: &[Entry<P, R>],
        cancel: &CancellationToken,
    ) -> Result<(), ParcelError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.ship(parcel, cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => match self.policy.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            size = parcel.len(),
                            error = %e,
                            "retrying shipment"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ParcelError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        error!(
                            attempt,
                            size = parcel.len(),
                            error = %e,
                            "shipment retries exhausted"
                        );
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        })
    }

    #[test]
    fn delays_grow_then_cap() {
        let p = policy(4);
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(p.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(p.next_delay(3), Some(Duration::from_millis(300)));
        assert_eq!(p.next_delay(4), Some(Duration::from_millis(300)));
        assert!(p.next_delay(5).is_none());
    }

    #[test]
    fn zero_retries_never_retries() {
        let p = policy(0);
        assert!(!p.should_retry(1));
        assert!(p.next_delay(1).is_none());
    }

    /// Fails transiently `failures` times, then resolves every entry.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Shipper<u32, u32> for Flaky {
        async fn ship(
            &self,
            parcel: &[Entry<u32, u32>],
            _cancel: &CancellationToken,
        ) -> Result<(), ParcelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(ParcelError::transient_msg("503 service unavailable"));
            }
            for entry in parcel {
                entry.resolve(*entry.payload());
            }
            Ok(())
        }
    }

    fn flaky(failures: u32, max_retries: u32) -> RetryingShipper<Flaky> {
        RetryingShipper::new(
            Flaky {
                failures,
                calls: AtomicU32::new(0),
            },
            RetryConfig {
                max_retries,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let shipper = flaky(2, 3);
        let (entry, ticket) = Entry::<u32, u32>::new(7);
        let parcel = vec![entry];
        let token = CancellationToken::new();

        shipper.ship(&parcel, &token).await.unwrap();

        assert_eq!(shipper.inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(ticket.wait(&token).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_retries_spent() {
        let shipper = flaky(5, 2);
        let (entry, _ticket) = Entry::<u32, u32>::new(7);

        let err = shipper
            .ship(&[entry], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(shipper.inner.calls.load(Ordering::SeqCst), 3);
    }

    struct Rejecting;

    #[async_trait]
    impl Shipper<u32, u32> for Rejecting {
        async fn ship(
            &self,
            _parcel: &[Entry<u32, u32>],
            _cancel: &CancellationToken,
        ) -> Result<(), ParcelError> {
            Err(ParcelError::shipment_msg("400 bad request"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let shipper = RetryingShipper::new(Rejecting, RetryConfig::default());
        let (entry, _ticket) = Entry::<u32, u32>::new(1);
        let err = shipper
            .ship(&[entry], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ParcelError::Shipment(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let shipper = flaky(10, 10);
        let (entry, _ticket) = Entry::<u32, u32>::new(1);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = shipper.ship(&[entry], &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
