//! Notification bus (§4.H): process-local pub/sub plus the delivery-adapter seam that
//! writes outcomes back onto the generation record.

pub mod adapter;
pub mod bus;
pub mod worker;

pub use adapter::{DeliveryAdapter, DeliveryError, NullAdapter};
pub use bus::NotificationBus;
pub use worker::run_delivery_worker;
