//! Centralized log text for the storage engine.
//!
//! Modules build a [`Message`] and pass it to one of the `msg_*` macros,
//! which route it to `tracing` at the matching level.
//!
//! ```rust
//! use taskvault::msg_info;
//! use taskvault::libs::messages::Message;
//!
//! msg_info!(Message::TaskCreated("project/setup".to_string()));
//! ```
pub mod display;
pub mod macros;
pub mod types;

pub use types::Message;
