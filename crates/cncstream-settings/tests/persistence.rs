use cncstream_communication::ControllerType;
use cncstream_settings::{Config, SettingsError};

#[test]
fn test_toml_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::new();
    config.connection.port = "/dev/ttyACM0".to_string();
    config.connection.firmware = ControllerType::TinyG;
    config.streaming.buffer_size_override = Some(200);
    config.streaming.single_step = true;
    config.save_to_file(&path).unwrap();

    let loaded = Config::load_from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_json_file_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"connection":{"port":"COM3","baud_rate":250000},"streaming":{"status_poll_interval_ms":0}}"#,
    )
    .unwrap();

    let config = Config::load_from_file(&path).unwrap();
    assert_eq!(config.connection.port, "COM3");
    assert_eq!(config.connection.baud_rate, 250000);
    assert_eq!(config.streaming.status_poll_interval_ms, 0);
    assert_eq!(config.streaming.query_timeout_ms, 2000);
}

#[test]
fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[connection]\nbaud_rate = 0\n").unwrap();
    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::InvalidSetting { .. })
    ));

    std::fs::write(&path, "[connection\n").unwrap();
    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::TomlDe(_))
    ));
}

#[test]
fn test_invalid_config_is_not_saved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let mut config = Config::new();
    config.streaming.header_width = 0;
    assert!(config.save_to_file(&path).is_err());
    assert!(!path.exists());
}
