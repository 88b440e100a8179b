//! Tracing subscriber setup for embedding applications and tests.
//!
//! The filter comes from `TASKVAULT_LOG`, then `RUST_LOG`, then defaults to
//! `info`. The engine itself only emits `tracing` events; installing a
//! subscriber is the host's choice.

use crate::libs::messages::Message;
use crate::{msg_debug, msg_error_anyhow};
use anyhow::Result;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "TASKVAULT_LOG";
const DEFAULT_FILTER: &str = "info";

/// Filter directive that [`init`] will use.
pub fn filter_directive() -> String {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

/// Installs a global fmt subscriber. Fails if one is already installed.
pub fn init() -> Result<()> {
    let directive = filter_directive();
    let filter = EnvFilter::try_new(&directive).map_err(|e| msg_error_anyhow!(format!("invalid log filter '{directive}': {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| msg_error_anyhow!(format!("failed to install log subscriber: {e}")))?;
    msg_debug!(Message::LoggingInitialized(directive));
    Ok(())
}

/// Like [`init`], but an already-installed subscriber is not an error.
pub fn try_init() {
    let _ = init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        try_init();
        try_init();
        assert!(!filter_directive().is_empty());
    }
}
