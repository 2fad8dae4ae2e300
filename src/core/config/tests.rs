use super::data::{path_display, EngineConfig};
use super::io::ConfigError;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_nonexistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nonexistent_config.toml");

    let config = EngineConfig::load_from_path(&config_path).expect("Failed to load config");

    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.flush_interval(), Duration::from_millis(200));
    assert_eq!(config.idle_timeout(), Duration::from_secs(60));
    assert_eq!(config.message_page_size, 20);
}

#[test]
fn partial_file_keeps_defaults_for_missing_fields() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        "base_url = \"https://agents.example.com\"\nflush_interval_ms = 50\n",
    )
    .expect("write");

    let config = EngineConfig::load_from_path(&config_path).expect("load");
    assert_eq!(config.base_url, "https://agents.example.com");
    assert_eq!(config.flush_interval(), Duration::from_millis(50));
    assert_eq!(config.queue_capacity, 256);
    assert_eq!(config.keepalive_interval(), Duration::from_secs(60));
}

#[test]
fn invalid_toml_reports_the_path() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "flush_interval_ms = \"soon\"").expect("write");

    let err = EngineConfig::load_from_path(&config_path).expect_err("parse error");
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("Failed to parse config"));
    assert!(std::error::Error::source(&err).is_some());
}

#[test]
fn test_config_persistence_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let config = EngineConfig {
        history_limit: 50,
        debug: true,
        ..EngineConfig::default()
    };
    config.save_to_path(&config_path).expect("save");

    let loaded = EngineConfig::load_from_path(&config_path).expect("load");
    assert_eq!(loaded, config);

    let updated = EngineConfig {
        history_limit: 10,
        ..loaded
    };
    updated.save_to_path(&config_path).expect("second save");
    let reloaded = EngineConfig::load_from_path(&config_path).expect("reload");
    assert_eq!(reloaded.history_limit, 10);
    assert!(reloaded.debug);
}

#[test]
fn zero_durations_are_clamped_where_a_zero_would_spin() {
    let config = EngineConfig {
        idle_timeout_secs: 0,
        keepalive_interval_secs: 0,
        ..EngineConfig::default()
    };
    assert_eq!(config.idle_timeout(), Duration::from_secs(1));
    assert_eq!(config.keepalive_interval(), Duration::from_secs(1));
}

#[cfg(unix)]
#[test]
fn path_display_shortens_home() {
    if let Some(home) = std::env::var_os("HOME") {
        let path = std::path::PathBuf::from(home).join(".config/streamturn/config.toml");
        assert_eq!(path_display(&path), "~/.config/streamturn/config.toml");
    }
}
