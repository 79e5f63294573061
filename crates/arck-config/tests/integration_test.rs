//! Integration tests for arck-config
//!
//! These tests verify the config loading pipeline with real file system operations.

use arck_config::testing::TestEnvironment;
use arck_config::{AdmissionMode, Config, ConfigError, LockMode};

/// Project config values land in the loaded config
#[test]
fn test_load_project_config_from_file() {
    let env = TestEnvironment::new().unwrap();
    env.write_project_config(
        r#"
[lease]
period_ms = 250
admission = "plain-bit"

[table]
lock_mode = "rw-lock"
size_classes = [16, 256]
max_load = 2

[inodes]
capacity = 4096
"#,
    )
    .unwrap();

    let contents = std::fs::read_to_string(env.project_config_path()).unwrap();
    let config = Config::from_toml_str(&contents).unwrap();

    assert_eq!(config.lease.period_ms, 250);
    assert_eq!(config.lease.period_ticks(), 250_000_000);
    assert_eq!(config.lease.admission, AdmissionMode::PlainBit);
    assert_eq!(config.table.lock_mode, LockMode::RwLock);
    assert_eq!(config.table.size_classes, vec![16, 256]);
    assert_eq!(config.table.max_load, 2);
    assert_eq!(config.inodes.capacity, 4096);
}

/// Missing sections fall back to defaults
#[test]
fn test_partial_config_keeps_defaults() {
    let config = Config::from_toml_str("[lease]\nperiod_ms = 10\n").unwrap();
    assert_eq!(config.lease.period_ms, 10);
    assert_eq!(config.lease.admission, AdmissionMode::Sentinel);
    assert_eq!(config.table, Config::default().table);
}

#[test]
fn test_unknown_admission_mode_is_rejected() {
    let err = Config::from_toml_str("[lease]\nadmission = \"honor-system\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

#[test]
fn test_empty_size_classes_rejected() {
    let err = Config::from_toml_str("[table]\nsize_classes = []\n").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            key: "table.size_classes",
            ..
        }
    ));
}

/// The default TOML is a complete, loadable document
#[test]
fn test_default_toml_loads_back() {
    let toml_str = Config::default_toml();
    let parsed = Config::from_toml_str(&toml_str).unwrap();
    assert_eq!(parsed, Config::default());
}

/// Malformed project file surfaces as a parse error through the layered loader
#[test]
fn test_layered_load_reports_malformed_project_file() {
    let env = TestEnvironment::new().unwrap();
    env.write_project_config("[lease\nperiod_ms = ").unwrap();
    assert!(matches!(env.load_config(), Err(ConfigError::Toml(_))));
}

/// Invalid project values are reported by the layered loader, never
/// replaced with defaults
#[test]
fn test_layered_load_reports_invalid_project_value() {
    let env = TestEnvironment::new().unwrap();
    env.write_project_config("[lease]\nperiod_ms = 0\n").unwrap();
    assert!(matches!(
        env.load_config(),
        Err(ConfigError::Invalid {
            key: "lease.period_ms",
            ..
        })
    ));
}
