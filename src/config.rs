//! Hardware configuration using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `SMU_` (nested keys separated by `__`)
//! 2. TOML configuration file (default: `config/smu.toml`)
//!
//! # Example
//!
//! ```toml
//! log_level = "info"
//!
//! [instruments.smu_1]
//! ip_address = "192.168.50.4"
//! serial_number = "MY59002082"
//! model = "B2902A"
//! calibration_expiration = "20210929"
//! ```
//!
//! ```text
//! # Switch an instrument to the mock driver
//! SMU_INSTRUMENTS__SMU_1__MOCK=true
//!
//! # Raise the log level
//! SMU_LOG_LEVEL=debug
//! ```

use crate::error::{SmuError, SmuResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/smu.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SMU_";

/// Top-level hardware configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Instruments keyed by their unique identifier
    #[serde(default)]
    pub instruments: HashMap<String, SmuConfig>,
}

/// Per-instrument configuration.
///
/// Every identification field is optional. An instrument needs either an
/// address (`visa_addr` or `ip_address`) or a `serial_number` to find itself
/// among the connector's resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmuConfig {
    /// Full resource string (e.g. `USB0::0x0957::0x8C18::MY51144607::INSTR`)
    #[serde(default)]
    pub visa_addr: Option<String>,
    /// IP address, used to synthesise a `TCPIP0` resource when `visa_addr` is absent
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Serial number
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Model number
    #[serde(default)]
    pub model: Option<String>,
    /// Calibration expiry as `YYYYMMDD` (string or integer in TOML)
    #[serde(default, deserialize_with = "deserialize_date")]
    pub calibration_expiration: Option<String>,
    /// Session I/O timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Use the mock driver instead of hardware
    #[serde(default)]
    pub mock: bool,
    /// Settle delays
    #[serde(default)]
    pub timing: TimingConfig,
    /// Dual-channel sweep compliance settings
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Fixed settle delays applied between commands and readback.
///
/// The defaults are sized for worst-case hardware settling on a B2902A.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay after enabling a voltage source, before the fault check
    #[serde(default = "default_source_voltage_settle")]
    pub source_voltage_settle_ms: u64,
    /// Delay after enabling a current source, before the fault check
    #[serde(default = "default_source_current_settle")]
    pub source_current_settle_ms: u64,
    /// Settle passed to `measure` after sourcing
    #[serde(default = "default_measure_settle")]
    pub measure_settle_ms: u64,
    /// Delay after switching an output off
    #[serde(default = "default_channel_off_settle")]
    pub channel_off_settle_ms: u64,
    /// Integration time (power-line cycles) for sourced acquisitions
    #[serde(default = "default_acquire_nplc")]
    pub acquire_nplc: u32,
}

/// Compliance and aperture settings for the dual-channel sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Current compliance on the voltage-list channel (A)
    #[serde(default = "default_ch1_current_compliance")]
    pub ch1_current_compliance: f64,
    /// Voltage compliance on the zero-current channel (V)
    #[serde(default = "default_ch2_voltage_compliance")]
    pub ch2_voltage_compliance: f64,
    /// Subtracted from the step time to get the sense aperture (s)
    #[serde(default = "default_aperture_margin")]
    pub aperture_margin: f64,
}

/// Result of comparing the calibration expiry with today's date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CalibrationStatus {
    /// Expiry is today or later
    Valid,
    /// Expiry is in the past
    Expired,
    /// No expiry date configured
    Unknown,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    4000
}

fn default_source_voltage_settle() -> u64 {
    250
}

fn default_source_current_settle() -> u64 {
    50
}

fn default_measure_settle() -> u64 {
    200
}

fn default_channel_off_settle() -> u64 {
    250
}

fn default_acquire_nplc() -> u32 {
    5
}

fn default_ch1_current_compliance() -> f64 {
    0.2
}

fn default_ch2_voltage_compliance() -> f64 {
    10.0
}

fn default_aperture_margin() -> f64 {
    0.01
}

fn deserialize_date<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DateField {
        Text(String),
        Number(u64),
    }

    Ok(
        Option::<DateField>::deserialize(deserializer)?.map(|field| match field {
            DateField::Text(text) => text.trim().to_string(),
            DateField::Number(n) => n.to_string(),
        }),
    )
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            source_voltage_settle_ms: default_source_voltage_settle(),
            source_current_settle_ms: default_source_current_settle(),
            measure_settle_ms: default_measure_settle(),
            channel_off_settle_ms: default_channel_off_settle(),
            acquire_nplc: default_acquire_nplc(),
        }
    }
}

impl TimingConfig {
    /// Settle after enabling a voltage source.
    pub fn source_voltage_settle(&self) -> Duration {
        Duration::from_millis(self.source_voltage_settle_ms)
    }

    /// Settle after enabling a current source.
    pub fn source_current_settle(&self) -> Duration {
        Duration::from_millis(self.source_current_settle_ms)
    }

    /// Settle used by the readback after sourcing.
    pub fn measure_settle(&self) -> Duration {
        Duration::from_millis(self.measure_settle_ms)
    }

    /// Settle after switching an output off.
    pub fn channel_off_settle(&self) -> Duration {
        Duration::from_millis(self.channel_off_settle_ms)
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            ch1_current_compliance: default_ch1_current_compliance(),
            ch2_voltage_compliance: default_ch2_voltage_compliance(),
            aperture_margin: default_aperture_margin(),
        }
    }
}

impl Default for SmuConfig {
    fn default() -> Self {
        Self {
            visa_addr: None,
            ip_address: None,
            serial_number: None,
            model: None,
            calibration_expiration: None,
            timeout_ms: default_timeout_ms(),
            mock: false,
            timing: TimingConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl SmuConfig {
    /// Parse and validate a per-instrument TOML table.
    pub fn from_toml(value: &toml::Value) -> SmuResult<Self> {
        let config: SmuConfig = value
            .clone()
            .try_into()
            .map_err(|e| SmuError::Configuration(format!("Invalid SMU config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work on any instrument.
    pub fn validate(&self) -> SmuResult<()> {
        for (key, value) in [
            ("visa_addr", &self.visa_addr),
            ("ip_address", &self.ip_address),
            ("serial_number", &self.serial_number),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(SmuError::Configuration(format!(
                    "'{}' field cannot be empty",
                    key
                )));
            }
        }

        if let Some(date) = &self.calibration_expiration {
            if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
                return Err(SmuError::Configuration(format!(
                    "'calibration_expiration' must be YYYYMMDD, got '{}'",
                    date
                )));
            }
        }

        if self.timeout_ms == 0 {
            return Err(SmuError::Configuration(
                "'timeout_ms' cannot be 0".to_string(),
            ));
        }

        if self.sweep.aperture_margin < 0.0 {
            return Err(SmuError::Configuration(
                "'sweep.aperture_margin' cannot be negative".to_string(),
            ));
        }

        Ok(())
    }

    /// Resource address: `visa_addr` if set, otherwise synthesised from `ip_address`.
    pub fn resolve_address(&self) -> Option<String> {
        if let Some(addr) = &self.visa_addr {
            return Some(addr.clone());
        }
        self.ip_address
            .as_ref()
            .map(|ip| format!("TCPIP0::{}::inst0::INSTR", ip))
    }

    /// Names of identification fields that are absent.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.visa_addr.is_none() && self.ip_address.is_none() {
            missing.push("visa_addr");
        }
        if self.serial_number.is_none() {
            missing.push("serial_number");
        }
        if self.model.is_none() {
            missing.push("model");
        }
        missing
    }

    /// True when the driver has enough information to locate the instrument.
    pub fn is_locatable(&self) -> bool {
        self.resolve_address().is_some() || self.serial_number.is_some()
    }

    /// Session timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Calibration status relative to `today` (`YYYYMMDD`).
    ///
    /// ISO basic dates order lexicographically, so a plain string comparison
    /// decides validity: the instrument is in calibration iff expiry >= today.
    pub fn calibration_status_on(&self, today: &str) -> CalibrationStatus {
        match &self.calibration_expiration {
            None => CalibrationStatus::Unknown,
            Some(expiry) if expiry.as_str() >= today => CalibrationStatus::Valid,
            Some(_) => CalibrationStatus::Expired,
        }
    }

    /// Calibration status relative to the local date.
    pub fn calibration_status(&self) -> CalibrationStatus {
        let today = chrono::Local::now().format("%Y%m%d").to_string();
        let status = self.calibration_status_on(&today);
        if status == CalibrationStatus::Expired {
            tracing::info!(
                expiration = self.calibration_expiration.as_deref().unwrap_or_default(),
                "SMU out of calibration"
            );
        }
        status
    }
}

impl HardwareConfig {
    /// Load from `config/smu.toml` and environment variables.
    pub fn load() -> SmuResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path, with environment overrides applied on top.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SmuResult<Self> {
        let config: HardwareConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate the log level and every instrument entry.
    pub fn validate(&self) -> SmuResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(SmuError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        for (id, instrument) in &self.instruments {
            instrument
                .validate()
                .map_err(|e| SmuError::Configuration(format!("instrument '{}': {}", id, e)))?;
        }

        Ok(())
    }

    /// Look up one instrument by its unique identifier.
    pub fn instrument(&self, id: &str) -> SmuResult<&SmuConfig> {
        self.instruments.get(id).ok_or_else(|| {
            SmuError::Configuration(format!("No instrument info for '{}'", id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SmuConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(4000));
        assert_eq!(
            config.timing.source_voltage_settle(),
            Duration::from_millis(250)
        );
        assert_eq!(
            config.timing.source_current_settle(),
            Duration::from_millis(50)
        );
        assert_eq!(config.timing.measure_settle(), Duration::from_millis(200));
        assert_eq!(
            config.timing.channel_off_settle(),
            Duration::from_millis(250)
        );
        assert_eq!(config.timing.acquire_nplc, 5);
        assert!((config.sweep.ch1_current_compliance - 0.2).abs() < f64::EPSILON);
        assert!((config.sweep.ch2_voltage_compliance - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_address_prefers_visa_addr() {
        let config = SmuConfig {
            visa_addr: Some("USB0::0x0957::0x8C18::MY51144607::INSTR".to_string()),
            ip_address: Some("10.0.0.2".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_address().as_deref(),
            Some("USB0::0x0957::0x8C18::MY51144607::INSTR")
        );
    }

    #[test]
    fn test_address_from_ip() {
        let config = SmuConfig {
            ip_address: Some("192.168.50.4".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_address().as_deref(),
            Some("TCPIP0::192.168.50.4::inst0::INSTR")
        );
        assert!(config.is_locatable());
        assert!(SmuConfig::default().resolve_address().is_none());
        assert!(!SmuConfig::default().is_locatable());
    }

    #[test]
    fn test_calibration_status() {
        let config = SmuConfig {
            calibration_expiration: Some("20210112".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.calibration_status_on("20210101"),
            CalibrationStatus::Valid
        );
        assert_eq!(
            config.calibration_status_on("20210112"),
            CalibrationStatus::Valid
        );
        assert_eq!(
            config.calibration_status_on("20210201"),
            CalibrationStatus::Expired
        );
        assert_eq!(
            SmuConfig::default().calibration_status_on("20210101"),
            CalibrationStatus::Unknown
        );
    }

    #[test]
    fn test_missing_fields() {
        let config = SmuConfig {
            serial_number: Some("MY51144607".to_string()),
            ..Default::default()
        };
        assert_eq!(config.missing_fields(), vec!["visa_addr", "model"]);
    }

    #[test]
    fn test_from_toml_accepts_integer_date() {
        let value = toml::Value::Table(toml::toml! {
            ip_address = "192.168.50.4"
            serial_number = "MY59002082"
            model = "E2902"
            calibration_expiration = 20210929
        });
        let config = SmuConfig::from_toml(&value).unwrap();
        assert_eq!(config.calibration_expiration.as_deref(), Some("20210929"));
        assert_eq!(config.model.as_deref(), Some("E2902"));
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        let bad_date = toml::Value::Table(toml::toml! {
            serial_number = "MY59002082"
            calibration_expiration = "2021-09-29"
        });
        assert!(SmuConfig::from_toml(&bad_date).is_err());

        let empty_serial = toml::Value::Table(toml::toml! {
            serial_number = ""
        });
        assert!(SmuConfig::from_toml(&empty_serial).is_err());

        let zero_timeout = toml::Value::Table(toml::toml! {
            ip_address = "10.0.0.1"
            timeout_ms = 0
        });
        assert!(SmuConfig::from_toml(&zero_timeout).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let config = HardwareConfig {
            log_level: "loud".to_string(),
            instruments: HashMap::new(),
        };
        assert!(config.validate().is_err());
        assert!(config.instrument("smu_1").is_err());
    }
}
