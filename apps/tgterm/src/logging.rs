//! Tracing bootstrap for the terminal front.

use std::{env, io};

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tgterm=debug,sync_runtime=debug";

/// Initialize the global subscriber, writing to stderr so stdout carries
/// nothing but snapshot lines.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `TGTERM_LOG`
/// 3) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("TGTERM_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}
