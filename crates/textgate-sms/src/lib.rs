//! SMS gateway integration.
//!
//! [`gateway`] wraps the HTTP API (send, delivery status, quota);
//! [`token`] signs and verifies the timestamped `webhookData` value
//! that authenticates reply callbacks.

pub mod gateway;
pub mod token;

pub use gateway::{DeliveryStatus, SendOutcome, SmsGateway};
