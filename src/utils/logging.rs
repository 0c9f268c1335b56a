use tracing::Level;

use crate::config::LogSettings;

/// Installs the global fmt subscriber at `settings.level`.
///
/// Later calls are no-ops, so tests and embedders can call it freely.
pub fn init(settings: &LogSettings) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level(settings))
        .with_target(false)
        .try_init();
}

/// The configured level, `info` when it does not parse.
pub fn level(settings: &LogSettings) -> Level {
    match settings.level.trim().to_lowercase().as_str() {
        "warning" => Level::WARN,
        other => other.parse().unwrap_or(Level::INFO),
    }
}
