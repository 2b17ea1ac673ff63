//! # telemetry
//!
//! why: structured logs for every node
//! relations: called once by the binary; tests may call it repeatedly
//! what: init_tracing (fmt subscriber, RUST_LOG via EnvFilter)

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `default_directives`.
///
/// Returns false when a subscriber was already installed.
pub fn init_tracing(default_directives: &str) -> bool {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives)),
        )
        .try_init()
        .is_ok()
}
