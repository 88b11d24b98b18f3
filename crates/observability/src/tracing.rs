//! Tracing subscriber initialization.
//!
//! Output is one JSON object per event on stdout. The filter comes from
//! `RUST_LOG` when it parses, otherwise from the caller's default.

use tracing_subscriber::EnvFilter;

/// Default directives: service crates at info, the SQL driver quieter.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Install the global subscriber. Returns `false` when one was already set.
pub fn init_with_filter(default_directives: &str) -> bool {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = filter_from(env.as_deref(), default_directives);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .with_current_span(true)
        .try_init()
        .is_ok()
}

fn filter_from(env_value: Option<&str>, default_directives: &str) -> EnvFilter {
    env_value
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives))
}
