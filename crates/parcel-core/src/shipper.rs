//! The downstream collaborators the engine is built around.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;
use crate::error::ParcelError;

/// Sends a closed parcel downstream.
///
/// # Contract
/// Before returning `Ok`, every entry in `parcel` should be resolved with a
/// value or an explicit per-entry failure. On `Err`, the engine resolves
/// whatever the shipper left unresolved with that same error, or with
/// cancellation if the error is [`ParcelError::Cancelled`].
///
/// Entries arrive in admission order.
#[async_trait]
pub trait Shipper<P, R>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn ship(
        &self,
        parcel: &[Entry<P, R>],
        cancel: &CancellationToken,
    ) -> Result<(), ParcelError>;
}

/// Runs after a successful shipment, before the parcel is retired.
#[async_trait]
pub trait AfterShip<P, R>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn after_ship(
        &self,
        parcel: &[Entry<P, R>],
        cancel: &CancellationToken,
    ) -> Result<(), ParcelError>;
}

/// Adapts a synchronous function into a [`Shipper`].
pub struct ShipperFn<F>(pub F);

#[async_trait]
impl<P, R, F> Shipper<P, R> for ShipperFn<F>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&[Entry<P, R>]) -> Result<(), ParcelError> + Send + Sync + 'static,
{
    async fn ship(
        &self,
        parcel: &[Entry<P, R>],
        _cancel: &CancellationToken,
    ) -> Result<(), ParcelError> {
        (self.0)(parcel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shipper_fn_resolves_entries() {
        let shipper = ShipperFn(|parcel: &[Entry<u32, u32>]| {
            for entry in parcel {
                entry.resolve(entry.payload() * 2);
            }
            Ok(())
        });

        let (entry, ticket) = Entry::<u32, u32>::new(21);
        let parcel = vec![entry];
        shipper
            .ship(&parcel, &CancellationToken::new())
            .await
            .unwrap();

        let value = ticket.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(value, 42);
    }
}
