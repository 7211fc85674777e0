//! Tracing subscriber setup. flexi_logger (wired up in [crate::config])
//! carries the `log` facade; this side catches the `tracing` spans and
//! events the server hot path emits.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter from RUST_LOG when set, the configured level otherwise, with the
/// usual chatty HTTP internals turned down.
fn build_filter(log_level: &str) -> EnvFilter {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!("{},h2=error,hyper=error,tower=error,rustls=warn", log_level.to_lowercase())
    });
    EnvFilter::new(directives)
}

pub fn init_tracing(log_level: &str) -> Result<(), String> {
    tracing_subscriber::registry()
        .with(build_filter(log_level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_prefers_rust_log_shape() {
        let filter = build_filter("DEBUG");
        assert!(filter.to_string().contains("debug"));
    }
}
