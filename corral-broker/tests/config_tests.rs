use corral_broker::{BrokerConfig, BrokerError};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

// ── Defaults ────────────────────────────────────────────────────

#[test]
fn defaults() {
    let config = BrokerConfig::default();
    assert_eq!(config.init_timeout(), Duration::from_secs(10));
    assert_eq!(config.call_timeout(), Duration::from_secs(60));
    assert_eq!(config.max_per_origin, 100);
    assert!(config.validate().is_ok());
}

// ── Parsing ─────────────────────────────────────────────────────

#[test]
fn empty_document_gives_defaults() {
    assert_eq!(BrokerConfig::from_toml_str("").unwrap(), BrokerConfig::default());
}

#[test]
fn partial_section_keeps_other_defaults() {
    let config = BrokerConfig::from_toml_str(
        r#"
        [broker]
        call-timeout-ms = 250
        max-per-origin = 8
        "#,
    )
    .unwrap();
    assert_eq!(config.call_timeout_ms, 250);
    assert_eq!(config.max_per_origin, 8);
    assert_eq!(config.init_timeout_ms, BrokerConfig::default().init_timeout_ms);
}

#[test]
fn zero_limits_are_rejected() {
    for doc in [
        "[broker]\ninit-timeout-ms = 0",
        "[broker]\ncall-timeout-ms = 0",
        "[broker]\nmax-per-origin = 0",
        "[broker]\nevent-capacity = 0",
    ] {
        assert!(
            matches!(BrokerConfig::from_toml_str(doc), Err(BrokerError::Config(_))),
            "{doc}"
        );
    }
}

#[test]
fn zero_tombstones_is_allowed() {
    let config = BrokerConfig::from_toml_str("[broker]\ntombstone-capacity = 0").unwrap();
    assert_eq!(config.tombstone_capacity, 0);
}

#[test]
fn syntax_errors_are_config_errors() {
    let err = BrokerConfig::from_toml_str("[broker\ncall-timeout-ms = ").unwrap_err();
    assert!(matches!(err, BrokerError::Config(_)));
}

#[test]
fn wrong_types_are_config_errors() {
    let err = BrokerConfig::from_toml_str("[broker]\nmax-per-origin = \"many\"").unwrap_err();
    assert!(matches!(err, BrokerError::Config(_)));
}

#[test]
fn serializes_with_kebab_case_keys() {
    let doc = toml::to_string(&BrokerConfig::default()).unwrap();
    assert!(doc.contains("init-timeout-ms = 10000"));
    assert!(doc.contains("max-per-origin = 100"));
}

// ── Loading from disk ───────────────────────────────────────────

#[test]
fn load_from_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = BrokerConfig::load_from(dir.path().join("absent.toml"));
    assert_eq!(config, BrokerConfig::default());
}

#[test]
fn load_from_valid_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[broker]\ninit-timeout-ms = 1500").unwrap();

    let config = BrokerConfig::load_from(file.path());
    assert_eq!(config.init_timeout(), Duration::from_millis(1500));
}

#[test]
fn load_from_invalid_file_falls_back_to_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[broker]\nmax-per-origin = 0").unwrap();

    assert_eq!(BrokerConfig::load_from(file.path()), BrokerConfig::default());
}
