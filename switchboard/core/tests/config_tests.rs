//! Integration Tests for Configuration Loading

use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use switchboard_core::{ClientConfig, ConfigError, TransportType};

#[test]
fn test_load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("client.toml");
    std::fs::write(
        &path,
        r#"
handshake_timeout_ms = 2500
max_reconnect_attempts = 4

[transport]
connect_timeout_ms = 750

[transport.transport]
kind = "unix_socket"
path = "/run/switchboard/test.sock"

[call_limit]
burst = 3.0
rate = 1.5

[packet_limit]
b = 40.0
r = 80.0

[reconnect]
base_ms = 100
max_ms = 5000
"#,
    )
    .unwrap();

    let config = ClientConfig::load_from_path(Some(path.as_path())).unwrap();

    assert_eq!(config.handshake_timeout(), Duration::from_millis(2500));
    assert_eq!(config.max_reconnect_attempts, Some(4));
    assert_eq!(config.transport.connect_timeout_ms, 750);
    assert!(matches!(
        config.transport.transport,
        TransportType::UnixSocket { path: Some(ref p) } if p.ends_with("test.sock")
    ));
    assert_eq!(config.call_limit.burst, 3.0);
    assert_eq!(config.call_limit.rate, 1.5);
    assert_eq!(config.packet_limit.burst, 40.0);
    assert_eq!(config.reconnect.base_ms, 100);
    // Unset keys keep their defaults
    assert_eq!(config.reconnect.factor, 2.0);
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = ClientConfig::load_from_path(Some(dir.path().join("absent.toml").as_path())).unwrap();
    assert_eq!(config.handshake_timeout_ms, ClientConfig::default().handshake_timeout_ms);
    assert_eq!(config.call_limit, ClientConfig::default().call_limit);
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("client.toml");
    std::fs::write(&path, "handshake_timeout_ms = [not toml").unwrap();

    let err = ClientConfig::load_from_path(Some(path.as_path())).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn test_invalid_limits_in_file_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("client.toml");
    std::fs::write(&path, "[packet_limit]\nburst = 0.0\nrate = 10.0\n").unwrap();

    match ClientConfig::load_from_path(Some(path.as_path())) {
        Err(ConfigError::ValidationError(msg)) => assert!(msg.starts_with("packet_limit")),
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn test_directory_in_place_of_file_is_a_read_error() {
    let dir = TempDir::new().unwrap();
    let err = ClientConfig::load_from_path(Some(dir.path())).unwrap_err();
    assert!(matches!(err, ConfigError::ReadError { .. }));
}
