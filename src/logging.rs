//! Tracing subscriber setup.
//!
//! Filter precedence: `RUST_LOG`, then `--debug`, then the configured level.

use std::io;

use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive used when `RUST_LOG` is not set.
pub fn directive(configured: &str, debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    let configured = configured.trim();
    if configured.is_empty() {
        "info".to_string()
    } else {
        configured.to_string()
    }
}

/// Install the global fmt subscriber writing to stderr.
///
/// Stdout is reserved for replies, so nothing is logged there. Calling this
/// twice is harmless.
pub fn init(configured: &str, debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = directive(configured, debug);
        EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            eprintln!("Warning: Invalid log level '{}', using 'info'", directive);
            EnvFilter::new("info")
        })
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
