// tests/02_config_file_loading.rs
//
// Exercises `FabricConfig::from_toml_file` against a real file on disk,
// independent of the environment-variable path `from_env` takes.

use meshframe::config::FabricConfig;
use std::io::Write;

#[test]
fn loads_service_settings_from_a_toml_file() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("meshframe.toml");
    let mut file = std::fs::File::create(&path).expect("failed to create config file");
    writeln!(
        file,
        r#"
        service_name = "billing-service"
        service_port = 7100
        service_version = "2.1.0"
        "#
    )
    .unwrap();

    let config = FabricConfig::from_toml_file(&path).expect("config file should load");
    assert_eq!(config.service_name, "billing-service");
    assert_eq!(config.service_port, 7100);
    assert_eq!(config.service_version, "2.1.0");
}

#[test]
fn missing_file_is_a_clean_error() {
    let err = FabricConfig::from_toml_file("/nonexistent/path/meshframe.toml").unwrap_err();
    assert!(err.to_string().contains("toml config error"));
}
