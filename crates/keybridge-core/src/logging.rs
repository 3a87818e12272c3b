//! Logging bootstrap for binaries and tests embedding the bridge.

use env_logger::Builder;
use log::LevelFilter;
use std::str::FromStr;

/// Initialise the global logger with `default_filter` (e.g. `"info"`),
/// letting `RUST_LOG` override it. Safe to call more than once; later
/// calls are ignored.
pub fn init(default_filter: &str) {
    let level = LevelFilter::from_str(default_filter).unwrap_or(LevelFilter::Info);
    let mut builder = Builder::from_default_env();
    builder.filter_level(level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    let _ = builder.try_init();
}
