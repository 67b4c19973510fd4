//! The coalescing engine.
//!
//! Callers submit requests into the single open parcel. The caller whose
//! request lands in an empty parcel is the *leader*: a driver task is spawned
//! on its behalf that waits for the parcel to fill or go idle, then ships it.
//! Everyone else is a *follower* and only waits on its own entry.
//!
//! ```text
//! Idle ──submit──▶ Open ──full | idle | age | cancelled──▶ Shipping ──▶ Idle
//! ```
//!
//! The admission that fills a parcel closes it on the spot and hands it to
//! the leader's driver, so a parcel never grows past the threshold it was
//! admitted under. Shipments are serialized per engine in close order: a
//! closed parcel waits for the one closed before it to retire, and meanwhile
//! a fresh parcel already accepts new requests.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::ActivityClock;
use crate::config::{duration_ms, validate_max_batch_size, CoalescerConfig};
use crate::entry::{Entry, Ticket};
use crate::error::ParcelError;
use crate::shipper::{AfterShip, Shipper};
use crate::stats::{CoalescerStats, ShipReason, StatsSnapshot};

/// Slack added to every idle wait to absorb timer and scheduling jitter.
pub const IDLE_GRACE: Duration = Duration::from_millis(10);

/// Coarse lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No open parcel.
    Idle,
    /// A parcel holds at least one entry and its leader is waiting.
    Open,
    /// At least one closed parcel is queued for, or with, the shipper.
    Shipping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Open => write!(f, "open"),
            Self::Shipping => write!(f, "shipping"),
        }
    }
}

/// The parcel currently accepting entries.
struct OpenParcel<P, R> {
    entries: Vec<Entry<P, R>>,
    /// Reaches the leader's driver when an admission fills the parcel.
    handoff: Option<oneshot::Sender<ClosedParcel<P, R>>>,
    /// Fires once the most recently closed parcel retires.
    last_closed: Option<oneshot::Receiver<()>>,
}

/// A parcel that accepts no more entries.
///
/// Dropping it retires the parcel: entries nobody resolved report
/// `Unresolved` and the next closed parcel may ship.
struct ClosedParcel<P, R> {
    entries: Vec<Entry<P, R>>,
    after: Option<oneshot::Receiver<()>>,
    _retired: oneshot::Sender<()>,
    unfinished: Arc<AtomicUsize>,
}

impl<P, R> Drop for ClosedParcel<P, R> {
    fn drop(&mut self) {
        self.unfinished.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Role<P, R> {
    Leader {
        opened_at: Instant,
        handoff: oneshot::Receiver<ClosedParcel<P, R>>,
    },
    Follower,
}

struct Shared<P, R> {
    name: String,
    max_batch_size: AtomicUsize,
    idle_timeout_ms: AtomicU64,
    /// 0 means no cap.
    max_age_ms: AtomicU64,
    open: Mutex<OpenParcel<P, R>>,
    activity: ActivityClock,
    /// Closed parcels not yet retired.
    unfinished: Arc<AtomicUsize>,
    shipper: Arc<dyn Shipper<P, R>>,
    after_ship: Option<Arc<dyn AfterShip<P, R>>>,
    stats: CoalescerStats,
}

/// Request-coalescing engine.
///
/// Cheap to clone; clones share the same open parcel.
pub struct Coalescer<P, R> {
    shared: Arc<Shared<P, R>>,
}

impl<P, R> Clone for Coalescer<P, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P, R> Coalescer<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Build an engine that hands closed parcels to `shipper`.
    pub fn new(
        config: CoalescerConfig,
        shipper: Arc<dyn Shipper<P, R>>,
    ) -> Result<Self, ParcelError> {
        Self::build(config, shipper, None)
    }

    /// Build an engine that also runs `after_ship` after every successful shipment.
    pub fn with_after_ship(
        config: CoalescerConfig,
        shipper: Arc<dyn Shipper<P, R>>,
        after_ship: Arc<dyn AfterShip<P, R>>,
    ) -> Result<Self, ParcelError> {
        Self::build(config, shipper, Some(after_ship))
    }

    fn build(
        config: CoalescerConfig,
        shipper: Arc<dyn Shipper<P, R>>,
        after_ship: Option<Arc<dyn AfterShip<P, R>>>,
    ) -> Result<Self, ParcelError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                max_batch_size: AtomicUsize::new(config.max_batch_size),
                idle_timeout_ms: AtomicU64::new(config.idle_ship_timeout_ms),
                max_age_ms: AtomicU64::new(config.max_batch_age_ms.unwrap_or(0)),
                name: config.name,
                open: Mutex::new(OpenParcel {
                    entries: Vec::new(),
                    handoff: None,
                    last_closed: None,
                }),
                activity: ActivityClock::new(),
                unfinished: Arc::new(AtomicUsize::new(0)),
                shipper,
                after_ship,
                stats: CoalescerStats::default(),
            }),
        })
    }

    /// Submit a request and wait for its individual result.
    pub async fn submit(&self, payload: P, cancel: &CancellationToken) -> Result<R, ParcelError> {
        let ticket = self.enqueue(payload, cancel)?;
        ticket.wait(cancel).await
    }

    /// Admit a request into the open parcel and return its ticket without waiting.
    ///
    /// Admits nothing and fails with [`ParcelError::Cancelled`] if `cancel`
    /// has already fired, or with [`ParcelError::NoRuntime`] when called
    /// outside a Tokio runtime.
    pub fn enqueue(
        &self,
        payload: P,
        cancel: &CancellationToken,
    ) -> Result<Ticket<R>, ParcelError> {
        if cancel.is_cancelled() {
            return Err(ParcelError::Cancelled);
        }
        let runtime = Handle::try_current().map_err(|_| ParcelError::NoRuntime)?;

        let (entry, ticket) = Entry::new(payload);
        let role = self.shared.admit(entry);
        self.shared.stats.record_submitted();

        if let Role::Leader { opened_at, handoff } = role {
            debug!(coalescer = %self.shared.name, "new parcel opened");
            let driver = Driver {
                shared: self.shared.clone(),
                handoff,
                opened_at,
                claimed: false,
            };
            // If the runtime is shutting down the task is dropped unpolled,
            // and the driver's drop retires the parcel.
            runtime.spawn(driver.run(cancel.clone()));
        }
        Ok(ticket)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn max_batch_size(&self) -> usize {
        self.shared.max_batch_size()
    }

    /// Change the size threshold. Entries already admitted are not re-evaluated.
    pub fn set_max_batch_size(&self, size: usize) -> Result<(), ParcelError> {
        validate_max_batch_size(size)?;
        self.shared.max_batch_size.store(size, Ordering::Release);
        Ok(())
    }

    pub fn idle_ship_timeout(&self) -> Duration {
        self.shared.idle_timeout()
    }

    /// Change the idle timeout. Zero is valid and ships almost immediately.
    pub fn set_idle_ship_timeout(&self, timeout: Duration) {
        self.shared
            .idle_timeout_ms
            .store(duration_ms(timeout), Ordering::Release);
    }

    pub fn max_batch_age(&self) -> Option<Duration> {
        self.shared.max_age()
    }

    pub fn set_max_batch_age(&self, age: Option<Duration>) -> Result<(), ParcelError> {
        let ms = match age {
            Some(age) if age.is_zero() => {
                return Err(ParcelError::InvalidConfig(
                    "max_batch_age must be positive when set".into(),
                ))
            }
            Some(age) => duration_ms(age).max(1),
            None => 0,
        };
        self.shared.max_age_ms.store(ms, Ordering::Release);
        Ok(())
    }

    /// Number of entries in the open parcel.
    pub fn pending(&self) -> usize {
        self.shared.lock_open().entries.len()
    }

    pub fn state(&self) -> EngineState {
        if self.shared.unfinished.load(Ordering::Acquire) > 0 {
            EngineState::Shipping
        } else if self.pending() > 0 {
            EngineState::Open
        } else {
            EngineState::Idle
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl<P, R> Shared<P, R> {
    fn lock_open(&self) -> MutexGuard<'_, OpenParcel<P, R>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Acquire)
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Acquire))
    }

    fn max_age(&self) -> Option<Duration> {
        match self.max_age_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Append under the admission lock. The first entry of a parcel makes its
    /// submitter the leader; the entry that fills it closes the parcel and
    /// hands it to that leader.
    fn admit(&self, entry: Entry<P, R>) -> Role<P, R> {
        let mut open = self.lock_open();
        let now = self.activity.touch();
        let role = if open.entries.is_empty() {
            let (tx, rx) = oneshot::channel();
            open.handoff = Some(tx);
            Role::Leader {
                opened_at: now,
                handoff: rx,
            }
        } else {
            Role::Follower
        };

        open.entries.push(entry);
        if open.entries.len() >= self.max_batch_size() {
            let closed = self.close(&mut open);
            if let Some(tx) = open.handoff.take() {
                // A refused parcel is dropped, which retires its entries.
                let _ = tx.send(closed);
            }
        }
        role
    }

    /// Swap the open parcel for an empty one, queueing it behind the parcel
    /// closed before it.
    fn close(&self, open: &mut OpenParcel<P, R>) -> ClosedParcel<P, R> {
        let (retired, next) = oneshot::channel();
        self.unfinished.fetch_add(1, Ordering::AcqRel);
        ClosedParcel {
            entries: std::mem::take(&mut open.entries),
            after: open.last_closed.replace(next),
            _retired: retired,
            unfinished: self.unfinished.clone(),
        }
    }
}

impl<P, R> Shared<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn ship_parcel(
        &self,
        mut parcel: ClosedParcel<P, R>,
        reason: ShipReason,
        cancel: &CancellationToken,
    ) {
        if let Some(previous) = parcel.after.take() {
            // Resolves on retirement whether or not the parcel shipped.
            let _ = previous.await;
        }

        let size = parcel.entries.len();
        self.stats.record_shipment(size, reason);
        debug!(coalescer = %self.name, size, %reason, "shipping parcel");

        let outcome = AssertUnwindSafe(self.run_shipment(&parcel.entries, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ParcelError::shipment_msg("shipper panicked")));

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                self.stats.record_cancelled();
                warn!(coalescer = %self.name, size, "shipment cancelled");
                for entry in &parcel.entries {
                    entry.cancel();
                }
            }
            Err(err) => {
                self.stats.record_failed();
                warn!(coalescer = %self.name, size, error = %err, "shipment failed");
                for entry in &parcel.entries {
                    entry.fail(err.clone());
                }
            }
        }
    }

    async fn run_shipment(
        &self,
        parcel: &[Entry<P, R>],
        cancel: &CancellationToken,
    ) -> Result<(), ParcelError> {
        self.shipper.ship(parcel, cancel).await?;
        if let Some(hook) = &self.after_ship {
            hook.after_ship(parcel, cancel).await?;
        }
        Ok(())
    }
}

/// Leader-side task for one parcel.
///
/// Dropped before it claims its parcel (its runtime shut down, or the task
/// was never polled), it closes the parcel and fails every entry so that
/// later admissions open a fresh one.
struct Driver<P, R> {
    shared: Arc<Shared<P, R>>,
    handoff: oneshot::Receiver<ClosedParcel<P, R>>,
    opened_at: Instant,
    claimed: bool,
}

impl<P, R> Driver<P, R> {
    /// Take this driver's parcel, closing it if no admission already has.
    /// The flag reports whether an admission closed it.
    fn claim(&mut self) -> Option<(ClosedParcel<P, R>, bool)> {
        let mut open = self.shared.lock_open();
        self.claimed = true;
        match self.handoff.try_recv() {
            Ok(parcel) => Some((parcel, true)),
            // Our sender is still in place, so the open parcel is ours.
            Err(TryRecvError::Empty) => {
                open.handoff = None;
                Some((self.shared.close(&mut open), false))
            }
            Err(TryRecvError::Closed) => None,
        }
    }

    fn claim_for(&mut self, reason: ShipReason) -> Option<(ClosedParcel<P, R>, ShipReason)> {
        self.claim().map(|(parcel, filled)| {
            let reason = if filled { ShipReason::Full } else { reason };
            (parcel, reason)
        })
    }
}

impl<P, R> Driver<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn run(mut self, cancel: CancellationToken) {
        if let Some((parcel, reason)) = self.await_shipment_trigger(&cancel).await {
            self.shared.ship_parcel(parcel, reason, &cancel).await;
        }
    }

    async fn await_shipment_trigger(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<(ClosedParcel<P, R>, ShipReason)> {
        let mut budget = self.shared.idle_timeout() + IDLE_GRACE;
        loop {
            let mut deadline = Instant::now() + budget;
            if let Some(age) = self.shared.max_age() {
                deadline = deadline.min(self.opened_at + age);
            }

            let cancelled = tokio::select! {
                handed = &mut self.handoff => {
                    self.claimed = true;
                    return handed.ok().map(|parcel| (parcel, ShipReason::Full));
                }
                _ = cancel.cancelled() => true,
                _ = sleep_until(deadline) => false,
            };
            if cancelled {
                return self.claim_for(ShipReason::Cancelled);
            }

            let now = Instant::now();
            if let Some(age) = self.shared.max_age() {
                if now >= self.opened_at + age {
                    return self.claim_for(ShipReason::Age);
                }
            }

            let idle = self.shared.idle_timeout();
            let last = self.shared.activity.last();
            if now.saturating_duration_since(last) >= idle {
                return self.claim_for(ShipReason::Idle);
            }
            // A later admission moved the idle deadline.
            budget = (last + idle + IDLE_GRACE).saturating_duration_since(now);
            trace!(
                coalescer = %self.shared.name,
                budget_ms = budget.as_millis() as u64,
                "idle deadline extended"
            );
        }
    }
}

impl<P, R> Drop for Driver<P, R> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        if let Some((parcel, _)) = self.claim() {
            warn!(
                coalescer = %self.shared.name,
                size = parcel.entries.len(),
                "parcel abandoned before shipping"
            );
            let err = ParcelError::shipment_msg("parcel abandoned before shipping");
            for entry in &parcel.entries {
                entry.fail(err.clone());
            }
        }
    }
}
