//! Logging macros for [`Message`](super::Message) values.
//!
//! Each macro formats the message through its `Display` impl and forwards it
//! to the matching `tracing` level. Extra structured fields may follow the
//! message:
//!
//! ```rust
//! use taskvault::msg_warning;
//! use taskvault::libs::messages::Message;
//!
//! msg_warning!(Message::TasksCleared(3));
//! msg_warning!(Message::TasksCleared(3), removed = 3);
//! ```

#[macro_export]
macro_rules! msg_debug {
    ($msg:expr) => {
        tracing::debug!("{}", $msg)
    };
    ($msg:expr, $($field:tt)+) => {
        tracing::debug!($($field)+, "{}", $msg)
    };
}

#[macro_export]
macro_rules! msg_info {
    ($msg:expr) => {
        tracing::info!("{}", $msg)
    };
    ($msg:expr, $($field:tt)+) => {
        tracing::info!($($field)+, "{}", $msg)
    };
}

#[macro_export]
macro_rules! msg_warning {
    ($msg:expr) => {
        tracing::warn!("{}", $msg)
    };
    ($msg:expr, $($field:tt)+) => {
        tracing::warn!($($field)+, "{}", $msg)
    };
}

#[macro_export]
macro_rules! msg_error {
    ($msg:expr) => {
        tracing::error!("{}", $msg)
    };
    ($msg:expr, $($field:tt)+) => {
        tracing::error!($($field)+, "{}", $msg)
    };
}

/// Builds an `anyhow::Error` from a message.
#[macro_export]
macro_rules! msg_error_anyhow {
    ($msg:expr) => {
        anyhow::anyhow!("{}", $msg)
    };
}
