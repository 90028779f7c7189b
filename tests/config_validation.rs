//! Integration tests for configuration loading and validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use serial_test::serial;
use std::time::Duration;
use tickwire::config::{NetworkConfig, DEFAULT_PORT};
use tickwire::error::ProtocolError;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_zero_ports_rejected() {
    let config = NetworkConfig::default_with_overrides(|config| {
        config.server.port = 0;
        config.client.port = 0;
    });
    let errors = config.validate();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|e| e.contains("Server port")));
    assert!(errors.iter().any(|e| e.contains("Client port")));
}

#[test]
fn test_pool_capacity_bounds() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("greater than 0")));

    config.server.max_connections = 100_000;
    assert!(config.validate().iter().any(|e| e.contains("too high")));
}

#[test]
fn test_auth_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.server.auth_timeout = Duration::from_millis(50);
    config.server.reject_disconnect_delay = Duration::from_millis(10);
    assert!(config.validate().iter().any(|e| e.contains("too short")));

    config.server.auth_timeout = Duration::from_secs(301);
    assert!(config.validate().iter().any(|e| e.contains("too long")));
}

#[test]
fn test_reject_delay_must_precede_auth_timeout() {
    let config = NetworkConfig::default_with_overrides(|config| {
        config.server.auth_timeout = Duration::from_secs(1);
        config.server.reject_disconnect_delay = Duration::from_secs(1);
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Reject disconnect delay")));
}

#[test]
fn test_empty_client_address() {
    let config = NetworkConfig::default_with_overrides(|config| {
        config.client.address = String::from("  ");
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_transport_limits() {
    let mut config = NetworkConfig::default();
    config.transport.event_queue_capacity = 0;
    config.transport.max_message_size = 8;
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Event queue capacity")));
    assert!(errors.iter().any(|e| e.contains("too small")));
}

#[test]
fn test_strict_validation_lists_every_problem() {
    let config = NetworkConfig::default_with_overrides(|config| {
        config.server.port = 0;
        config.logging.app_name = String::new();
    });
    let Err(ProtocolError::ConfigError(message)) = config.validate_strict() else {
        panic!("expected a configuration error");
    };
    assert!(message.contains("Server port"));
    assert!(message.contains("Application name"));
}

#[test]
fn test_toml_durations_are_milliseconds() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        port = 30000
        auth_timeout = 2500
        reject_disconnect_delay = 250

        [logging]
        log_level = "debug"
        "#,
    )
    .expect("parse");

    assert_eq!(config.server.port, 30000);
    assert_eq!(config.server.auth_timeout, Duration::from_millis(2500));
    assert_eq!(config.server.reject_disconnect_delay, Duration::from_millis(250));
    assert_eq!(config.client.port, DEFAULT_PORT);
    assert_eq!(config.logging.log_level, Level::DEBUG);
}

#[test]
fn test_invalid_toml() {
    assert!(matches!(
        NetworkConfig::from_toml("[server]\nport = \"many\""),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_file_roundtrip() {
    let path = std::env::temp_dir().join(format!("tickwire-config-{}.toml", std::process::id()));
    let config = NetworkConfig::default_with_overrides(|config| {
        config.server.max_connections = 32;
        config.client.address = String::from("10.0.0.2");
    });
    config.save_to_file(&path).expect("save");

    let loaded = NetworkConfig::from_file(&path).expect("load");
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.server.max_connections, 32);
    assert_eq!(loaded.client.address, "10.0.0.2");
    assert_eq!(loaded.server.auth_timeout, config.server.auth_timeout);
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        NetworkConfig::from_file("/nonexistent/tickwire.toml"),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("TICKWIRE_SERVER_PORT", "31000");
    std::env::set_var("TICKWIRE_AUTH_TIMEOUT_MS", "750");
    std::env::set_var("TICKWIRE_CLIENT_ADDRESS", "192.168.1.9");
    let config = NetworkConfig::from_env();
    std::env::remove_var("TICKWIRE_SERVER_PORT");
    std::env::remove_var("TICKWIRE_AUTH_TIMEOUT_MS");
    std::env::remove_var("TICKWIRE_CLIENT_ADDRESS");

    let config = config.expect("env config");
    assert_eq!(config.server.port, 31000);
    assert_eq!(config.server.auth_timeout, Duration::from_millis(750));
    assert_eq!(config.client.address, "192.168.1.9");
}

#[test]
#[serial]
fn test_env_garbage_is_an_error() {
    std::env::set_var("TICKWIRE_MAX_CONNECTIONS", "lots");
    let result = NetworkConfig::from_env();
    std::env::remove_var("TICKWIRE_MAX_CONNECTIONS");

    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}
