//! Integration tests for hardware configuration loading
//!
//! Tests that touch `SMU_` environment variables are serialised so they do
//! not leak overrides into each other.

use keysight_smu::config::{CalibrationStatus, HardwareConfig};
use keysight_smu::smu::{self, SourceMeter};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
log_level = "debug"

[instruments.smu_1]
ip_address = "192.168.50.4"
serial_number = "MY59002082"
model = "E2902"
calibration_expiration = "20210929"

[instruments.smu_1.timing]
measure_settle_ms = 100

[instruments.smu_2]
visa_addr = "USB0::0x0957::0x8C18::MY51144607::INSTR"
serial_number = "MY51144607"
model = "B2902A"
calibration_expiration = 99991231
mock = true
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = write_config(CONFIG);
    let config = HardwareConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.instruments.len(), 2);

    let smu_1 = config.instrument("smu_1").unwrap();
    assert_eq!(
        smu_1.resolve_address().as_deref(),
        Some("TCPIP0::192.168.50.4::inst0::INSTR")
    );
    assert_eq!(smu_1.timing.measure_settle(), Duration::from_millis(100));
    // Unset timing keys keep their defaults
    assert_eq!(
        smu_1.timing.source_voltage_settle(),
        Duration::from_millis(250)
    );
    assert_eq!(smu_1.calibration_status(), CalibrationStatus::Expired);
    assert!(!smu_1.mock);

    let smu_2 = config.instrument("smu_2").unwrap();
    assert_eq!(smu_2.calibration_expiration.as_deref(), Some("99991231"));
    assert_eq!(smu_2.calibration_status(), CalibrationStatus::Valid);
    assert!(smu_2.mock);

    assert!(config.instrument("smu_3").is_err());
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_config(CONFIG);
    std::env::set_var("SMU_LOG_LEVEL", "warn");
    std::env::set_var("SMU_INSTRUMENTS__SMU_1__MOCK", "true");

    let result = HardwareConfig::load_from(file.path());

    std::env::remove_var("SMU_LOG_LEVEL");
    std::env::remove_var("SMU_INSTRUMENTS__SMU_1__MOCK");

    let config = result.unwrap();
    assert_eq!(config.log_level, "warn");
    assert!(config.instrument("smu_1").unwrap().mock);
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = HardwareConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.log_level, "info");
    assert!(config.instruments.is_empty());
}

#[test]
#[serial]
fn test_validate_rejects_bad_entries() {
    let file = write_config(
        r#"
[instruments.smu_1]
serial_number = "MY59002082"
calibration_expiration = "29-09-2021"
"#,
    );
    let config = HardwareConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[tokio::test]
#[serial]
async fn test_factory_from_loaded_config() {
    let file = write_config(CONFIG);
    let config = HardwareConfig::load_from(file.path()).unwrap();

    let mut mock = smu::build("smu_2", config.instrument("smu_2").unwrap());
    mock.open(Duration::from_secs(1)).await.unwrap();
    assert_eq!(mock.id_string().unwrap(), "Mock Keysight SMU");

    let real = smu::build("smu_1", config.instrument("smu_1").unwrap());
    assert!(!real.is_open());
}
