//! Delivery boundary: the capability the funnel needs from a chat
//! transport, kept narrow so tests can substitute a mock.

use crate::InboundEvent;
use crate::error::DeliveryError;
use futures::Stream;
use std::pin::Pin;

/// Inbound event stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Outbound delivery capability of the chat transport.
///
/// [`DeliveryError::Permanent`] means the recipient can never be reached
/// again; every other failure is transient and handled by the caller's
/// rollback path.
pub trait DeliveryGateway: Send + Sync + 'static {
    fn send(
        &self,
        user_id: &str,
        text: &str,
    ) -> impl std::future::Future<Output = std::result::Result<(), DeliveryError>> + Send;
}

impl<G: DeliveryGateway> DeliveryGateway for std::sync::Arc<G> {
    fn send(
        &self,
        user_id: &str,
        text: &str,
    ) -> impl std::future::Future<Output = std::result::Result<(), DeliveryError>> + Send {
        G::send(self, user_id, text)
    }
}
