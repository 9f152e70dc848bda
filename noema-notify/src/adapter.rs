//! Delivery adapter seam: one implementation per transport (Telegram, Discord, web socket).
//! Each adapter owns its own retry policy; the worker only records the final outcome.

use async_trait::async_trait;
use thiserror::Error;

use noema_events::BusEvent;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Attempts to deliver `event` to this adapter's transport, retrying internally per
    /// its own policy. Returns `Ok(())` only once the transport has acknowledged delivery.
    async fn deliver(&self, event: &BusEvent) -> Result<(), DeliveryError>;
}

/// Delivery adapter that logs and drops; used for `notificationPlatform = none` and in
/// tests where no real transport is wired up.
pub struct NullAdapter;

#[async_trait]
impl DeliveryAdapter for NullAdapter {
    async fn deliver(&self, event: &BusEvent) -> Result<(), DeliveryError> {
        tracing::debug!(kind = event.kind(), "null adapter dropped event");
        Ok(())
    }
}
