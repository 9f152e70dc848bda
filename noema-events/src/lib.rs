//! Notification bus wire protocol: event type + payload + delivery envelope.
//!
//! This crate defines the shape shared by every publisher (`noema-lifecycle`,
//! `noema-scheduler`) and every subscriber (`noema-notify`'s delivery adapters). It has no
//! dependency on the rest of the workspace so adapters can depend on it alone.

pub mod envelope;
pub mod event;

pub use envelope::{Envelope, EnvelopeState};
pub use event::BusEvent;
