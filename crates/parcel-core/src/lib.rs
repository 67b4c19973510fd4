//! parcel-core — request coalescing for many small concurrent calls.
//!
//! # Overview
//!
//! Independent callers submit requests as if each made its own downstream
//! call. Requests are grouped into *parcels* that are shipped as one call,
//! and every caller still receives its own result, error or cancellation.
//!
//! - [`Coalescer`] — the engine: admission, leader election, the full-vs-idle
//!   trigger race and serialized shipment
//! - [`RequestBatcher`] / [`FireAndForgetBatcher`] — caller-facing façades
//! - [`Shipper`] / [`AfterShip`] — the injected downstream collaborators
//! - [`Entry`] / [`Ticket`] — one request and its first-writer-wins result slot
//! - [`policy`] module — retry wrapper for shippers
//! - [`telemetry`] module — log subscriber setup for binaries
//!
//! # Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use parcel_core::{CoalescerConfig, Entry, ParcelError, RequestBatcher, ShipperFn};
//!
//! # async fn demo() -> Result<(), ParcelError> {
//! let shipper = ShipperFn(|parcel: &[Entry<u64, u64>]| -> Result<(), ParcelError> {
//!     for entry in parcel {
//!         entry.resolve(entry.payload() * 2);
//!     }
//!     Ok(())
//! });
//! let config = CoalescerConfig::new("doubler", 32, Duration::from_millis(5));
//! let batcher = RequestBatcher::<u64, u64>::new(config, Arc::new(shipper))?;
//! assert_eq!(batcher.call(21).await?, 42);
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod coalescer;
pub mod config;
pub mod entry;
pub mod error;
pub mod policy;
pub mod shipper;
pub mod stats;
pub mod telemetry;

mod clock;

pub use batcher::{FireAndForgetBatcher, RequestBatcher};
pub use coalescer::{Coalescer, EngineState, IDLE_GRACE};
pub use config::CoalescerConfig;
pub use entry::{Entry, Ticket};
pub use error::{ParcelError, SharedError};
pub use policy::{RetryConfig, RetryPolicy, RetryingShipper};
pub use shipper::{AfterShip, Shipper, ShipperFn};
pub use stats::{ShipReason, StatsSnapshot};
pub use tokio_util::sync::CancellationToken;
