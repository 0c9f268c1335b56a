use super::load_config;
use super::settings::Settings;
use serial_test::serial;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert!(settings.server.server_id.starts_with("server-"));
    assert_eq!(settings.bus.channel, "main");
    assert_eq!(settings.bus.heartbeat_interval_ms, 10_000);
    assert_eq!(settings.bus.membership_ttl_secs, 60);
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("BUSLINE_SERVER__PORT", Some("9100")),
            ("BUSLINE_SERVER__SERVER_ID", Some("replica-a")),
            ("BUSLINE_BUS__HEARTBEAT_INTERVAL_MS", Some("250")),
            ("BUSLINE_STORE__PATH", Some("/tmp/busline-test")),
        ],
        || {
            let settings = load_config().expect("load_config failed");
            assert_eq!(settings.server.port, 9100);
            assert_eq!(settings.server.server_id, "replica-a");
            assert_eq!(settings.bus.heartbeat_interval_ms, 250);
            assert_eq!(settings.store.path, "/tmp/busline-test");
            // untouched values keep their defaults
            assert_eq!(settings.server.host, "127.0.0.1");
            assert_eq!(settings.bus.dedup_window_ms, 30_000);
        },
    );
}

#[test]
#[serial]
fn test_missing_environment_uses_defaults() {
    temp_env::with_vars_unset(["BUSLINE_SERVER__PORT", "BUSLINE_BUS__CHANNEL"], || {
        let settings = load_config().expect("load_config failed");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.bus.channel, "main");
    });
}
