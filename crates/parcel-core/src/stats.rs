//! Lock-free counters describing what a coalescer has shipped.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Why a leader stopped waiting and shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipReason {
    /// The parcel reached `max_batch_size`.
    Full,
    /// No admission for `idle_ship_timeout`.
    Idle,
    /// The parcel hit `max_batch_age`.
    Age,
    /// The leader's token fired while waiting.
    Cancelled,
}

impl std::fmt::Display for ShipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Idle => write!(f, "idle"),
            Self::Age => write!(f, "age"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CoalescerStats {
    submitted: AtomicU64,
    shipments: AtomicU64,
    entries_shipped: AtomicU64,
    full_triggered: AtomicU64,
    idle_triggered: AtomicU64,
    age_triggered: AtomicU64,
    cancel_triggered: AtomicU64,
    failed_shipments: AtomicU64,
    cancelled_shipments: AtomicU64,
    largest_parcel: AtomicU64,
}

impl CoalescerStats {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shipment(&self, size: usize, reason: ShipReason) {
        let size = size as u64;
        self.shipments.fetch_add(1, Ordering::Relaxed);
        self.entries_shipped.fetch_add(size, Ordering::Relaxed);
        self.largest_parcel.fetch_max(size, Ordering::Relaxed);
        let counter = match reason {
            ShipReason::Full => &self.full_triggered,
            ShipReason::Idle => &self.idle_triggered,
            ShipReason::Age => &self.age_triggered,
            ShipReason::Cancelled => &self.cancel_triggered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed_shipments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled_shipments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            shipments: self.shipments.load(Ordering::Relaxed),
            entries_shipped: self.entries_shipped.load(Ordering::Relaxed),
            full_triggered: self.full_triggered.load(Ordering::Relaxed),
            idle_triggered: self.idle_triggered.load(Ordering::Relaxed),
            age_triggered: self.age_triggered.load(Ordering::Relaxed),
            cancel_triggered: self.cancel_triggered.load(Ordering::Relaxed),
            failed_shipments: self.failed_shipments.load(Ordering::Relaxed),
            cancelled_shipments: self.cancelled_shipments.load(Ordering::Relaxed),
            largest_parcel: self.largest_parcel.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a coalescer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests admitted into a parcel.
    pub submitted: u64,
    /// Parcels handed to the shipper.
    pub shipments: u64,
    /// Entries across all shipped parcels.
    pub entries_shipped: u64,
    pub full_triggered: u64,
    pub idle_triggered: u64,
    pub age_triggered: u64,
    pub cancel_triggered: u64,
    /// Shipments that ended in a non-cancellation error.
    pub failed_shipments: u64,
    /// Shipments that ended in cancellation.
    pub cancelled_shipments: u64,
    pub largest_parcel: u64,
}

impl StatsSnapshot {
    /// Mean entries per shipment, or 0.0 before the first shipment.
    pub fn mean_parcel_size(&self) -> f64 {
        if self.shipments == 0 {
            0.0
        } else {
            self.entries_shipped as f64 / self.shipments as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipment_counters() {
        let stats = CoalescerStats::default();
        stats.record_shipment(3, ShipReason::Full);
        stats.record_shipment(1, ShipReason::Idle);
        stats.record_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.shipments, 2);
        assert_eq!(snap.entries_shipped, 4);
        assert_eq!(snap.full_triggered, 1);
        assert_eq!(snap.idle_triggered, 1);
        assert_eq!(snap.failed_shipments, 1);
        assert_eq!(snap.largest_parcel, 3);
        assert!((snap.mean_parcel_size() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_mean_is_zero() {
        assert_eq!(StatsSnapshot::default().mean_parcel_size(), 0.0);
    }
}
