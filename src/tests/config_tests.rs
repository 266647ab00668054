use super::*;
use serial_test::serial;
use tempfile::TempDir;

fn clear_env() {
    std::env::remove_var(RUN_PATH_ENV);
    std::env::remove_var(CONFIG_PATH_ENV);
    std::env::remove_var(SOCKET_ENV);
}

#[test]
fn test_defaults_match_standard_layout() {
    let config = ServiceConfig::default();
    assert_eq!(config.run_root, PathBuf::from("/run/geopm-service"));
    assert_eq!(config.config_root, PathBuf::from("/etc/geopm-service"));
    assert_eq!(config.watch_interval_ms, 1000);
    assert!(!config.share_write_lock_by_sid);
    assert!(!config.audit_removed_sessions);
    assert!(config.catalog_path.is_none());
}

#[test]
fn test_partial_yaml_fills_defaults() {
    let yaml = r#"
run_root: /tmp/geopm-run
watch_interval_ms: 250
share_write_lock_by_sid: true
"#;
    let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.run_root, PathBuf::from("/tmp/geopm-run"));
    assert_eq!(config.config_root, PathBuf::from("/etc/geopm-service"));
    assert_eq!(config.watch_interval_ms, 250);
    assert!(config.share_write_lock_by_sid);
}

#[test]
fn test_unknown_key_rejected() {
    let yaml = "run_root: /tmp/x\nmode: rw\n";
    let result: Result<ServiceConfig, _> = serde_yaml::from_str(yaml);
    assert!(result.is_err());
}

#[test]
fn test_load_rejects_relative_paths() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("geopmd.yaml");
    std::fs::write(&path, "run_root: relative/run\n").unwrap();
    let err = ServiceConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("absolute"), "{err}");
}

#[test]
fn test_load_rejects_zero_interval() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("geopmd.yaml");
    std::fs::write(&path, "watch_interval_ms: 0\n").unwrap();
    assert!(ServiceConfig::load(&path).is_err());
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("geopmd.yaml");
    std::fs::write(&path, "run_root: /tmp/from-file\n").unwrap();

    std::env::set_var(RUN_PATH_ENV, "/tmp/from-env");
    std::env::set_var(SOCKET_ENV, "/tmp/from-env.sock");
    let config = ServiceConfig::resolve(Some(&path)).unwrap();
    clear_env();

    assert_eq!(config.run_root, PathBuf::from("/tmp/from-env"));
    assert_eq!(config.socket_path, PathBuf::from("/tmp/from-env.sock"));
    assert_eq!(config.config_root, PathBuf::from("/etc/geopm-service"));
}

#[test]
#[serial]
fn test_empty_env_value_ignored() {
    clear_env();
    std::env::set_var(CONFIG_PATH_ENV, "");
    let mut config = ServiceConfig::default();
    config.apply_env_overrides();
    clear_env();
    assert_eq!(config.config_root, PathBuf::from("/etc/geopm-service"));
}
