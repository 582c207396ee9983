// Tracing setup
//
// The model emits `tracing` events: `info` when a network is built (with its
// parameter count), `debug`/`trace` spans along the forward path. Nothing is
// printed until a subscriber is installed; `init_tracing` installs a `fmt`
// subscriber filtered by `RUST_LOG` (default `info`).

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber. Only the first successful call
/// installs it; a failed install can be retried.
pub fn init_tracing() -> Result<(), InitError> {
    if INITIALISED.get().is_some() {
        return Err(InitError::AlreadyInitialised);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| InitError::Subscriber(e.to_string()))?;
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    /// Another crate installed a global subscriber first.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_install_is_not_latched() {
        // Another subscriber owns the global slot, so every install fails
        // with the subscriber error, never with AlreadyInitialised.
        let _ = Registry::default().try_init();
        assert!(matches!(init_tracing(), Err(InitError::Subscriber(_))));
        assert!(matches!(init_tracing(), Err(InitError::Subscriber(_))));
        assert!(INITIALISED.get().is_none());
    }
}
