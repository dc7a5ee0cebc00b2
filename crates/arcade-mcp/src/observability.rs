//! Logging setup

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the tracing subscriber once for the process.
///
/// Output goes to stderr so the stdio transport owns stdout. Plain text by
/// default, JSON with `ARCADE_LOG_FORMAT=json`. Filter comes from `RUST_LOG`,
/// falling back to `default_filter`.
pub fn init_tracing(default_filter: &str) {
    TRACING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let json = std::env::var("ARCADE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::init_tracing;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing("info");
        init_tracing("debug");
    }
}
