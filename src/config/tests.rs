use super::types::*;
use super::GatewayConfig;
use std::path::Path;

#[test]
fn test_load_sample_config() {
    let cfg = GatewayConfig::load(Path::new("config.toml")).unwrap();
    assert_eq!(cfg.mappings.directory, Path::new("mappings"));
    assert_eq!(cfg.mappings.default_version.as_deref(), Some("v1"));
    assert_eq!(cfg.errors.file.as_deref(), Some(Path::new("errors.toml")));
    assert_eq!(cfg.rate_limit.rejected_code, 429);
    assert!(cfg.rate_limit.clients.contains_key("mobile-app"));
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = GatewayConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg.mappings.directory, Path::new("mappings"));
    assert!(cfg.mappings.publish_on_start);
    assert_eq!(cfg.mappings.settle_ms, 50);
    assert!(!cfg.store.is_distributed());
    assert_eq!(cfg.store.etcd.mappings_prefix, "/portico/mappings");
    assert_eq!(cfg.auth.timeout_ms, 2000);
    assert_eq!(cfg.rate_limit.reset_interval_secs, 60);
    assert_eq!(cfg.backend.connect_timeout_ms, 3000);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "mappings": { "directory": "/etc/portico/mappings", "default_version": "v2", "reload_interval_secs": 30 },
        "store": { "etcd": { "endpoints": ["http://127.0.0.1:2379"] } },
        "auth": { "validate_url": "http://auth.internal/validate" },
        "rate_limit": { "clients": { "partner": { "requests": 5, "window_secs": 60 } } },
        "plugins": { "hooks": ["portico.hook.Log"] }
    }"#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.json");
    std::fs::write(&path, json).unwrap();

    let cfg = GatewayConfig::load(&path).unwrap();
    assert_eq!(cfg.mappings.default_version.as_deref(), Some("v2"));
    assert_eq!(cfg.mappings.reload_interval_secs, Some(30));
    assert!(cfg.store.is_distributed());
    assert_eq!(
        cfg.rate_limit.clients.get("partner"),
        Some(&ClientLimitConfig { requests: 5, window_secs: 60 })
    );
    assert_eq!(cfg.plugins.hooks, vec!["portico.hook.Log".to_string()]);
}

#[test]
fn test_null_sections_fall_back_to_defaults() {
    let json = r#"{ "mappings": null, "rate_limit": null }"#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.json");
    std::fs::write(&path, json).unwrap();

    let cfg = GatewayConfig::load(&path).unwrap();
    assert_eq!(cfg.mappings.directory, Path::new("mappings"));
    assert_eq!(cfg.rate_limit.rejected_code, 429);
}

#[test]
fn test_unsupported_extension_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, "mappings: {}").unwrap();
    let err = GatewayConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("unsupported config format"));
}

#[test]
fn test_validate_defaults_ok() {
    assert!(GatewayConfig::default().validate().is_ok());
}

#[test]
fn test_validate_empty_directory_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.mappings.directory = "".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_reload_interval_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.mappings.reload_interval_secs = Some(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_reset_interval_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.rate_limit.reset_interval_secs = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_rejected_code_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.rate_limit.rejected_code = 42;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_negative_client_limit_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.rate_limit.clients.insert(
        "broken".to_string(),
        ClientLimitConfig { requests: -1, window_secs: 60 },
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_backend_timeout_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.backend.response_timeout_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_non_http_urls_fail() {
    let mut cfg = GatewayConfig::default();
    cfg.auth.validate_url = Some("auth.internal/validate".to_string());
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.rate_limit.limits_url = Some("ftp://limits".to_string());
    assert!(cfg.validate().is_err());
}
