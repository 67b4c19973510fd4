//! Resilience wrappers applied around a shipper.
//!
//! ```text
//! Parcel → [RetryingShipper] → [Shipper] → downstream
//! ```

pub mod retry;

pub use retry::{RetryConfig, RetryPolicy, RetryingShipper};
