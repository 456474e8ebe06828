//! Core crate for Textgate — shared error taxonomy, configuration,
//! relational storage, phone-number handling, and response templates.
//!
//! Everything the pipeline crates share lives here so that the portal,
//! mailbox, SMS, and engine crates only ever talk to each other through
//! the store and these types.

pub mod config;
pub mod error;
pub mod model;
pub mod phone;
pub mod store;
pub mod templates;

pub use error::{Error, Result};
pub use store::Store;
