//! Error types shared by the engine, its façades and shippers.

use std::sync::Arc;

use thiserror::Error;

/// A downstream failure shared by every entry of a parcel.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors surfaced to callers and returned by shippers.
///
/// The type is cheap to clone: one shipment failure is handed to every
/// entry the shipper left unresolved.
#[derive(Debug, Clone, Error)]
pub enum ParcelError {
    /// Configuration rejected by the constructor or a setter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The request, or the whole shipment, was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The downstream call failed and should not be retried.
    #[error("shipment failed: {0}")]
    Shipment(SharedError),

    /// The downstream call failed but may succeed if attempted again.
    #[error("transient shipment failure: {0}")]
    Transient(SharedError),

    /// The entry was retired with its parcel without ever being resolved.
    #[error("request retired without a result")]
    Unresolved,

    /// Submitted outside a Tokio runtime, so no driver could be started.
    #[error("no Tokio runtime to drive the parcel")]
    NoRuntime,
}

impl ParcelError {
    /// Wrap a permanent downstream error.
    pub fn shipment<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Shipment(Arc::new(err))
    }

    /// Wrap a downstream error a retry wrapper may retry.
    pub fn transient<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transient(Arc::new(err))
    }

    /// Permanent shipment failure built from a plain message.
    pub fn shipment_msg(msg: impl Into<String>) -> Self {
        Self::Shipment(message(msg))
    }

    /// Transient shipment failure built from a plain message.
    pub fn transient_msg(msg: impl Into<String>) -> Self {
        Self::Transient(message(msg))
    }

    /// Returns `true` for cancellation-class errors.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the failure is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if both errors carry the very same downstream failure.
    pub fn same_failure(&self, other: &ParcelError) -> bool {
        match (self, other) {
            (Self::Shipment(a), Self::Shipment(b)) | (Self::Transient(a), Self::Transient(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Self::Cancelled, Self::Cancelled)
            | (Self::Unresolved, Self::Unresolved)
            | (Self::NoRuntime, Self::NoRuntime) => true,
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) => a == b,
            _ => false,
        }
    }
}

fn message(msg: impl Into<String>) -> SharedError {
    let boxed: Box<dyn std::error::Error + Send + Sync> = msg.into().into();
    Arc::from(boxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ParcelError::Cancelled.is_cancelled());
        assert!(!ParcelError::Cancelled.is_retryable());
        assert!(ParcelError::transient_msg("503").is_retryable());
        assert!(!ParcelError::shipment_msg("400").is_retryable());
    }

    #[test]
    fn display_includes_source() {
        let err = ParcelError::shipment_msg("connection reset");
        assert_eq!(err.to_string(), "shipment failed: connection reset");
    }

    #[test]
    fn clones_share_the_failure() {
        let err = ParcelError::shipment_msg("boom");
        let copy = err.clone();
        assert!(err.same_failure(&copy));
        assert!(!err.same_failure(&ParcelError::shipment_msg("boom")));
    }
}
