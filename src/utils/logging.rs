//! Tracing setup for the binary and the tests.

use tracing_subscriber::EnvFilter;

/// Directives from `RUST_LOG` win over the configured level. An unknown
/// level name falls back to `info`.
pub fn filter(default_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match default_level.to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        level @ ("error" | "warn" | "info" | "debug" | "trace" | "off") => level.to_string(),
        _ => "info".to_string(),
    };
    // sled is chatty at debug and below
    EnvFilter::new(format!("{level},sled=warn"))
}

/// Install the global subscriber; later calls are no-ops.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .with_target(false)
        .try_init();
}
