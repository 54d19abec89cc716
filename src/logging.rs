use log::LevelFilter;

/// Install env_logger with `level` as the default filter. `RUST_LOG`, when set,
/// still takes precedence. Calling this twice is harmless.
pub fn init(level: &str) {
    let filter = level.parse().unwrap_or(LevelFilter::Info);

    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter).format_timestamp_millis();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already initialised");
    }
}
