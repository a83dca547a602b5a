//! Tracing subscriber setup
//!
//! The engine only emits `tracing` events; hosts that embed it call
//! [`init_tracing`] once at startup (or install their own subscriber).

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,hive_reconciler=info";

/// Install a global subscriber: plain or JSON formatted, filtered by `RUST_LOG`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_ok()
    }
}
