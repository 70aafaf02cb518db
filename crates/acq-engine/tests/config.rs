use acq_engine::EngineConfig;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_engine_table_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[engine]
max_sync_failures = 5
timeout_margin = "750ms"
settle_time = "20ms"

[simulation]
repetition = "8x8"
"#
    )
    .unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.max_sync_failures, 5);
    assert_eq!(config.timeout_margin, Duration::from_millis(750));
    assert_eq!(config.settle_time, Duration::from_millis(20));
    // Untouched keys keep their defaults.
    assert_eq!(config.retry_delay, EngineConfig::default().retry_delay);
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, EngineConfig::default());
}

#[test]
fn test_malformed_value_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[engine]\ntimeout_margin = \"soon\"").unwrap();
    assert!(EngineConfig::load(file.path()).is_err());
}
