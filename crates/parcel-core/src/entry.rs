//! Entries and their single-assignment result slots.
//!
//! Each submitted request becomes an [`Entry`] owned by the open parcel,
//! paired with a [`Ticket`] held by the caller. The slot between them is
//! first-writer-wins: a shipper, the engine's failure path and the caller's
//! own cancellation may all race to resolve it; only the first write lands.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ParcelError;

type Outcome<R> = Result<R, ParcelError>;

struct Slot<R> {
    tx: Mutex<Option<oneshot::Sender<Outcome<R>>>>,
}

impl<R> Slot<R> {
    fn try_resolve(&self, outcome: Outcome<R>) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The caller may have stopped waiting; the write still counts.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn is_resolved(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// One caller's request as seen by a shipper.
pub struct Entry<P, R> {
    payload: P,
    slot: Arc<Slot<R>>,
}

impl<P, R> Entry<P, R> {
    /// Create an entry and the ticket its caller awaits.
    pub fn new(payload: P) -> (Self, Ticket<R>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Slot {
            tx: Mutex::new(Some(tx)),
        });
        let entry = Self {
            payload,
            slot: slot.clone(),
        };
        (entry, Ticket { rx, slot })
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Resolve with a value. Returns `false` if the slot was already resolved.
    pub fn resolve(&self, value: R) -> bool {
        self.slot.try_resolve(Ok(value))
    }

    /// Resolve with an error. Returns `false` if the slot was already resolved.
    pub fn fail(&self, err: ParcelError) -> bool {
        self.slot.try_resolve(Err(err))
    }

    /// Resolve as cancelled. Returns `false` if the slot was already resolved.
    pub fn cancel(&self) -> bool {
        self.fail(ParcelError::Cancelled)
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }
}

// The ticket shares the slot, so retiring an entry must write to it explicitly.
impl<P, R> Drop for Entry<P, R> {
    fn drop(&mut self) {
        self.slot.try_resolve(Err(ParcelError::Unresolved));
    }
}

impl<P: fmt::Debug, R> fmt::Debug for Entry<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("payload", &self.payload)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// The caller's side of an entry.
pub struct Ticket<R> {
    rx: oneshot::Receiver<Outcome<R>>,
    slot: Arc<Slot<R>>,
}

impl<R> Ticket<R> {
    /// Wait for the entry to be resolved.
    ///
    /// If `cancel` fires first the slot is try-set to cancelled; should the
    /// shipment have resolved it already, that result is returned instead.
    pub async fn wait(self, cancel: &CancellationToken) -> Outcome<R> {
        let Ticket { mut rx, slot } = self;
        tokio::select! {
            biased;
            received = &mut rx => flatten(received),
            _ = cancel.cancelled() => {
                if slot.try_resolve(Err(ParcelError::Cancelled)) {
                    Err(ParcelError::Cancelled)
                } else {
                    flatten(rx.await)
                }
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }
}

impl<R> fmt::Debug for Ticket<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

fn flatten<R>(received: Result<Outcome<R>, oneshot::error::RecvError>) -> Outcome<R> {
    received.unwrap_or(Err(ParcelError::Unresolved))
}
