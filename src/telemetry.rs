// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracing initialisation for engine processes.
//!
//! `RUST_LOG`-style filtering via the env filter; plain or JSON line
//! output. Safe to call more than once: later calls are no-ops.

use tracing_subscriber::EnvFilter;

/// Output format for tracing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Returns whether
/// this call installed the subscriber.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_initialisation_is_a_noop() {
        let first = init_tracing(LogFormat::Text);
        let second = init_tracing(LogFormat::Text);
        // At most one call can win; the second must not panic.
        assert!(!(first && second));
    }
}
