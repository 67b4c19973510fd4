//! Caller-facing façades over [`Coalescer`].
//!
//! - [`RequestBatcher`] returns each caller its own result.
//! - [`FireAndForgetBatcher`] returns only completion; entries the shipper
//!   leaves unresolved complete with `()` after a successful shipment.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::coalescer::Coalescer;
use crate::config::CoalescerConfig;
use crate::entry::{Entry, Ticket};
use crate::error::ParcelError;
use crate::shipper::{AfterShip, Shipper};

/// Submit a request, get its individual result.
pub struct RequestBatcher<P, R> {
    engine: Coalescer<P, R>,
}

impl<P, R> Clone for RequestBatcher<P, R> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<P, R> RequestBatcher<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(
        config: CoalescerConfig,
        shipper: Arc<dyn Shipper<P, R>>,
    ) -> Result<Self, ParcelError> {
        Ok(Self {
            engine: Coalescer::new(config, shipper)?,
        })
    }

    pub async fn request(&self, payload: P, cancel: &CancellationToken) -> Result<R, ParcelError> {
        self.engine.submit(payload, cancel).await
    }

    /// [`request`](Self::request) with a token that never fires.
    pub async fn call(&self, payload: P) -> Result<R, ParcelError> {
        self.request(payload, &CancellationToken::new()).await
    }

    pub fn coalescer(&self) -> &Coalescer<P, R> {
        &self.engine
    }
}

/// Completes every entry still open after a successful shipment.
struct CompleteRemaining;

#[async_trait]
impl<P> AfterShip<P, ()> for CompleteRemaining
where
    P: Send + Sync + 'static,
{
    async fn after_ship(
        &self,
        parcel: &[Entry<P, ()>],
        cancel: &CancellationToken,
    ) -> Result<(), ParcelError> {
        let cancelled = cancel.is_cancelled();
        for entry in parcel {
            if cancelled {
                entry.cancel();
            } else {
                entry.resolve(());
            }
        }
        Ok(())
    }
}

/// Submit a request, get completion with no payload.
pub struct FireAndForgetBatcher<P> {
    engine: Coalescer<P, ()>,
}

impl<P> Clone for FireAndForgetBatcher<P> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<P> FireAndForgetBatcher<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(
        config: CoalescerConfig,
        shipper: Arc<dyn Shipper<P, ()>>,
    ) -> Result<Self, ParcelError> {
        Ok(Self {
            engine: Coalescer::with_after_ship(config, shipper, Arc::new(CompleteRemaining))?,
        })
    }

    /// Submit and wait for the parcel carrying `payload` to be shipped.
    pub async fn submit(&self, payload: P, cancel: &CancellationToken) -> Result<(), ParcelError> {
        self.engine.submit(payload, cancel).await
    }

    /// Submit without waiting; the returned ticket completes on shipment.
    pub fn post(&self, payload: P, cancel: &CancellationToken) -> Result<Ticket<()>, ParcelError> {
        self.engine.enqueue(payload, cancel)
    }

    pub fn coalescer(&self) -> &Coalescer<P, ()> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::future::join_all;

    fn config(max: usize) -> CoalescerConfig {
        CoalescerConfig::new("facade", max, Duration::from_millis(20))
    }

    struct Upper;

    #[async_trait]
    impl Shipper<String, String> for Upper {
        async fn ship(
            &self,
            parcel: &[Entry<String, String>],
            _cancel: &CancellationToken,
        ) -> Result<(), ParcelError> {
            for entry in parcel {
                entry.resolve(entry.payload().to_uppercase());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_returns_individual_results() {
        let batcher = RequestBatcher::<String, String>::new(config(3), Arc::new(Upper)).unwrap();

        let results = join_all(["a", "b", "c"].map(|s| batcher.call(s.to_string()))).await;

        let values: Vec<String> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec!["A", "B", "C"]);
        assert_eq!(batcher.coalescer().stats().shipments, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_follower_does_not_disturb_others() {
        let batcher = RequestBatcher::<String, String>::new(config(10), Arc::new(Upper)).unwrap();
        let keep = CancellationToken::new();
        let quit = CancellationToken::new();
        quit.cancel();

        let leader = batcher.request("x".to_string(), &keep);
        let follower = async {
            // Admitted before the token fires, then abandons its wait.
            let ticket = batcher.coalescer().enqueue("y".to_string(), &keep).unwrap();
            ticket.wait(&quit).await
        };
        let (leader, follower) = tokio::join!(leader, follower);

        assert_eq!(leader.unwrap(), "X");
        assert!(follower.unwrap_err().is_cancelled());
    }

    /// Records payloads and resolves nothing.
    #[derive(Default)]
    struct Sink {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Shipper<u32, ()> for Sink {
        async fn ship(
            &self,
            parcel: &[Entry<u32, ()>],
            _cancel: &CancellationToken,
        ) -> Result<(), ParcelError> {
            let mut seen = self.seen.lock().unwrap();
            for entry in parcel {
                seen.push(*entry.payload());
                if *entry.payload() == 13 {
                    entry.fail(ParcelError::shipment_msg("unlucky"));
                }
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_completes_unresolved_entries() {
        let sink = Arc::new(Sink::default());
        let batcher = FireAndForgetBatcher::<u32>::new(config(3), sink.clone()).unwrap();
        let token = CancellationToken::new();

        let results = join_all([12, 13, 14].map(|n| batcher.submit(n, &token))).await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ParcelError::Shipment(_))));
        assert!(results[2].is_ok());
        assert_eq!(*sink.seen.lock().unwrap(), vec![12, 13, 14]);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_cancels_with_leader() {
        let batcher =
            FireAndForgetBatcher::<u32>::new(config(10), Arc::new(Sink::default())).unwrap();
        let leader_token = CancellationToken::new();
        let follower_token = CancellationToken::new();

        let leader = batcher.post(1, &leader_token).unwrap();
        let follower = batcher.post(2, &follower_token).unwrap();
        leader_token.cancel();

        assert!(leader.wait(&leader_token).await.unwrap_err().is_cancelled());
        assert!(follower.wait(&follower_token).await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_shares_shipment_failure() {
        let failing = crate::shipper::ShipperFn(|_: &[Entry<u32, ()>]| -> Result<(), ParcelError> {
            Err(ParcelError::shipment_msg("queue offline"))
        });
        let batcher = FireAndForgetBatcher::<u32>::new(config(2), Arc::new(failing)).unwrap();
        let token = CancellationToken::new();

        let (a, b) = tokio::join!(batcher.submit(1, &token), batcher.submit(2, &token));

        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(a.same_failure(&b));
    }
}
