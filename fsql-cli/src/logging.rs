//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Filter directives, e.g. `fsql_migrate=debug`.
pub const LOG_ENV: &str = "FSQL_LOG";

/// Output format: `full` (default), `compact`, or `json`.
pub const LOG_FORMAT_ENV: &str = "FSQL_LOG_FORMAT";

/// Install the global subscriber, writing to stderr.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match std::env::var(LOG_FORMAT_ENV).as_deref() {
        Ok("json") => builder.json().try_init(),
        Ok("compact") => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
