mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BusSettings, LogSettings, ServerSettings, Settings, StoreSettings};

/// Loads the configuration from `config/default` and the environment
/// (`BUSLINE_SERVER__PORT`, `BUSLINE_BUS__HEARTBEAT_INTERVAL_MS`, ...),
/// merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("BUSLINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server.as_ref();
    let bus = partial.bus.as_ref();

    Settings {
        server: ServerSettings {
            host: server
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server.and_then(|s| s.port).unwrap_or(default.server.port),
            server_id: server
                .and_then(|s| s.server_id.clone())
                .unwrap_or(default.server.server_id),
        },
        bus: BusSettings {
            channel: bus
                .and_then(|b| b.channel.clone())
                .unwrap_or(default.bus.channel),
            heartbeat_interval_ms: bus
                .and_then(|b| b.heartbeat_interval_ms)
                .unwrap_or(default.bus.heartbeat_interval_ms),
            reconnect_interval_ms: bus
                .and_then(|b| b.reconnect_interval_ms)
                .unwrap_or(default.bus.reconnect_interval_ms),
            membership_ttl_secs: bus
                .and_then(|b| b.membership_ttl_secs)
                .unwrap_or(default.bus.membership_ttl_secs),
            dedup_window_ms: bus
                .and_then(|b| b.dedup_window_ms)
                .unwrap_or(default.bus.dedup_window_ms),
        },
        store: StoreSettings {
            path: partial
                .store
                .and_then(|s| s.path)
                .unwrap_or(default.store.path),
        },
        log: LogSettings {
            level: partial
                .log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    }
}

#[cfg(test)]
mod tests;
