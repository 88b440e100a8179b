//! Models, configuration, errors and support code shared by the storage
//! engine and the hierarchy engine.

/// Storage configuration and its JSON loader.
pub mod config;

/// Typed storage errors and their classification.
pub mod error;

/// Task change notifications.
pub mod events;

/// Tracing subscriber setup.
pub mod logging;

/// Log message catalogue and logging macros.
pub mod messages;

/// Backoff for transient database failures.
pub mod retry;

/// Task model, status machine and update records.
pub mod task;
