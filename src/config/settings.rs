use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub store: StoreSettings,
    pub log: LogSettings,
}

/// Where the broker listens and how it identifies itself in the shared store.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Recorded in channel membership and used as the holder id for dedup locks.
    pub server_id: String,
}

/// Protocol timing shared by the client and the server.
#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    /// Channel a client joins when none is given on the command line.
    pub channel: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    /// Membership silently expires when no Ping arrives within this window.
    pub membership_ttl_secs: u64,
    /// How long a lock-and-execute lock suppresses a repeated operation.
    pub dedup_window_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub bus: Option<PartialBusSettings>,
    pub store: Option<PartialStoreSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBusSettings {
    pub channel: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnect_interval_ms: Option<u64>,
    pub membership_ttl_secs: Option<u64>,
    pub dedup_window_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                server_id: format!("server-{}", uuid::Uuid::new_v4()),
            },
            bus: BusSettings {
                channel: "main".to_string(),
                heartbeat_interval_ms: 10_000,
                reconnect_interval_ms: 2_000,
                membership_ttl_secs: 60,
                dedup_window_ms: 30_000,
            },
            store: StoreSettings {
                path: "busline_db".to_string(),
            },
            log: LogSettings::default(),
        }
    }
}
