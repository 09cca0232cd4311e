//! CLI integration tests.
//!
//! These tests verify the CLI argument parsing and configuration loading.

use std::ffi::OsString;
use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use coordkit::cli::{parse_args_from, Args};
use coordkit::config::Config;

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("coordkit")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_defaults() {
    let result = parse_args_from(args(&[])).unwrap();

    assert!(result.host.is_none());
    assert!(result.port.is_none());
    assert!(result.config.is_none());
    assert!(result.endpoints.is_empty());
    assert!(result.session_timeout_ms.is_none());
    assert!(!result.help);
}

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "-H",
        "0.0.0.0",
        "-p",
        "8080",
        "-e",
        "127.0.0.1:2181",
        "--session-timeout",
        "4000",
        "-l",
        "debug",
    ]))
    .unwrap();

    assert_eq!(result.host.unwrap().to_string(), "0.0.0.0");
    assert_eq!(result.port, Some(8080));
    assert_eq!(result.endpoints, vec!["127.0.0.1:2181"]);
    assert_eq!(result.session_timeout_ms, Some(4000));
    assert_eq!(result.log_level, Some("debug".to_string()));
}

#[test]
fn test_cli_rejects_garbage() {
    assert!(parse_args_from(args(&["--port", "99999"])).is_err());
    assert!(parse_args_from(args(&["--unknown-flag"])).is_err());
    assert!(parse_args_from(args(&["-e"])).is_err());
}

// ============================================================================
// Config Loading Tests
// ============================================================================

#[test]
fn test_load_defaults_without_file() {
    let config = Config::load(&Args::default()).unwrap();
    if std::env::var("COORDKIT_PORT").is_err() {
        assert_eq!(config.server.port, 3000);
    }
    assert!(!config.client.endpoints.is_empty());
}

#[test]
fn test_load_file_then_args() {
    let json = r#"{
        "server": { "port": 9000 },
        "client": {
            "endpoints": ["10.0.0.1:2181"],
            "session_timeout_ms": 8000,
            "connection_timeout_ms": 2000
        },
        "logging": { "level": "warn" }
    }"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let path = file.path().to_string_lossy().to_string();
    let parsed = parse_args_from(args(&["-c", &path, "--session-timeout", "1500"])).unwrap();
    let config = Config::load(&parsed).unwrap();

    // The port comes from the file unless COORDKIT_PORT is set in the
    // environment running the tests.
    if std::env::var("COORDKIT_PORT").is_err() {
        assert_eq!(config.server.port, 9000);
    }
    assert_eq!(config.client.session_timeout_ms, 1500);

    let session = config.to_session_config();
    assert_eq!(session.session_timeout, Duration::from_millis(1500));
    assert_eq!(session.connection_timeout, Duration::from_millis(2000));
}

#[test]
fn test_load_missing_file_fails() {
    let parsed = parse_args_from(args(&["-c", "/definitely/not/here.json"])).unwrap();
    assert!(Config::load(&parsed).is_err());
}

#[test]
fn test_ensemble_section_maps_to_config() {
    let json = r#"{ "ensemble": { "change_log_capacity": 32, "reaper_interval_ms": 100 } }"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();
    let ensemble = config.to_ensemble_config();
    assert_eq!(ensemble.change_log_capacity, 32);
    assert_eq!(ensemble.reaper_interval, Duration::from_millis(100));
}
