//! Error types for the SMU driver.
//!
//! This module defines `SmuError`, the single error type returned by every
//! driver operation. Using the `thiserror` crate, it gives callers one place to
//! match on the ways an instrument session can fail.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: A required hardware configuration value is missing or
//!   invalid (e.g. no address and no serial number to look one up).
//! - **`ConfigLoad`**: Wraps `figment` extraction errors from the TOML file or
//!   environment overrides.
//! - **`Connection`**: The session could not be opened, or `*RST`/`*IDN?` failed
//!   on both the first attempt and the single retry.
//! - **`DeviceFault`**: The instrument answered `:SYST:ERR:CODE:ALL?` with
//!   something other than `+0`. Carries the raw code and the call-site tag.
//! - **`Parse`**: A numeric reply contained a token that is not a number.
//! - **`Transport`**: Raw channel I/O failed (socket closed, timeout, VISA error).
//!
//! Transports report `anyhow::Error`; `#[from]` lets the driver lift those into
//! `SmuError::Transport` with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type SmuResult<T> = std::result::Result<T, SmuError>;

/// Errors raised by SMU sessions.
#[derive(Error, Debug)]
pub enum SmuError {
    /// Missing or invalid hardware configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be extracted.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// Session open or identity query failed after the retry.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Instrument reported a nonzero error code.
    #[error("SCPI error {code} {tag}")]
    DeviceFault {
        /// Raw status text returned by the error query.
        code: String,
        /// Call-site tag identifying the command batch that faulted.
        tag: String,
    },

    /// A reply token could not be parsed as a number.
    #[error("Failed to parse '{token}' as a number in response '{response}'")]
    Parse {
        /// The offending token.
        token: String,
        /// The full reply line it came from.
        response: String,
    },

    /// Channel outside the instrument's channel set.
    #[error("Invalid SMU channel: {0}")]
    InvalidChannel(String),

    /// Operation attempted without an open session.
    #[error("SMU session is not open")]
    NotConnected,

    /// Sweep reply did not contain four values per step.
    #[error("Sweep returned {actual} values, expected {expected}")]
    SweepShape {
        /// Expected number of values (4 x sweep length).
        expected: usize,
        /// Number of values actually returned.
        actual: usize,
    },

    /// Channel I/O failure.
    #[error("Transport error: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl SmuError {
    /// True when the instrument itself reported the failure.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, SmuError::DeviceFault { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_fault_display() {
        let err = SmuError::DeviceFault {
            code: "-222".to_string(),
            tag: "source_dcv".to_string(),
        };
        assert_eq!(err.to_string(), "SCPI error -222 source_dcv");
        assert!(err.is_device_fault());
    }

    #[test]
    fn test_transport_from_anyhow() {
        let err: SmuError = anyhow::anyhow!("socket closed").into();
        assert!(matches!(err, SmuError::Transport(_)));
        assert!(err.to_string().contains("socket closed"));
        assert!(!err.is_device_fault());
    }

    #[test]
    fn test_sweep_shape_display() {
        let err = SmuError::SweepShape {
            expected: 8,
            actual: 6,
        };
        assert_eq!(err.to_string(), "Sweep returned 6 values, expected 8");
    }
}
