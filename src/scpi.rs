//! SCPI response codec and fault check.
//!
//! Replies from the instrument are single text lines. Numeric replies are either
//! one value (`+1.000000E+00`) or a comma-separated list. The helpers here turn
//! those lines into typed values and fail with [`SmuError::Parse`] on anything
//! that is not a number.

use crate::error::{SmuError, SmuResult};
use serde::Serialize;

/// Query returning every pending error code, or `+0` when the queue is empty.
pub const ERROR_QUERY: &str = ":SYST:ERR:CODE:ALL?";

/// Reply to [`ERROR_QUERY`] meaning "no error".
pub const NO_ERROR: &str = "+0";

/// Identity query.
pub const IDN_QUERY: &str = "*IDN?";

/// Status byte query.
pub const STB_QUERY: &str = "*STB?";

/// Check an error-query reply.
///
/// Returns `Ok(false)` when `status` is the no-error sentinel (the line
/// terminator is ignored). Any other reply is logged and returned as
/// [`SmuError::DeviceFault`] carrying the raw text and `tag`.
pub fn check_fault(status: &str, tag: &str) -> SmuResult<bool> {
    if status.trim() == NO_ERROR {
        return Ok(false);
    }
    tracing::error!(code = %status.trim(), tag, "SCPI error");
    Err(SmuError::DeviceFault {
        code: status.to_string(),
        tag: tag.to_string(),
    })
}

/// Parse a single numeric reply.
pub fn parse_f64(response: &str) -> SmuResult<f64> {
    let token = response.trim();
    token.parse::<f64>().map_err(|_| SmuError::Parse {
        token: token.to_string(),
        response: response.to_string(),
    })
}

/// Parse a comma-separated numeric reply.
///
/// An empty reply parses as an empty list.
pub fn parse_f64_list(response: &str) -> SmuResult<Vec<f64>> {
    let line = response.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    line.split(',')
        .map(|token| {
            let token = token.trim();
            token.parse::<f64>().map_err(|_| SmuError::Parse {
                token: token.to_string(),
                response: response.to_string(),
            })
        })
        .collect()
}

/// Parse a `*STB?` reply such as `+0` or `+64`.
pub fn parse_status_byte(response: &str) -> SmuResult<u8> {
    let token = response.trim();
    token
        .strip_prefix('+')
        .unwrap_or(token)
        .parse::<u8>()
        .map_err(|_| SmuError::Parse {
            token: token.to_string(),
            response: response.to_string(),
        })
}

/// Format values as a SCPI list argument (`1.8,1.805,1.81`).
pub fn format_list(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Fields of an `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Manufacturer name.
    pub manufacturer: String,
    /// Model number (e.g. `B2902A`).
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Firmware revision.
    pub firmware: String,
}

impl Identity {
    /// Parse `manufacturer,model,serial,firmware`.
    ///
    /// The firmware field is optional; fewer than three fields is an error.
    pub fn parse(response: &str) -> SmuResult<Self> {
        let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
        if fields.len() < 3 {
            return Err(SmuError::Connection(format!(
                "Malformed identity reply: '{}'",
                response.trim()
            )));
        }
        Ok(Self {
            manufacturer: fields[0].to_string(),
            model: fields[1].to_string(),
            serial_number: fields[2].to_string(),
            firmware: fields.get(3).map(|s| s.to_string()).unwrap_or_default(),
        })
    }

    /// Rejoin the fields in `*IDN?` order.
    pub fn id_string(&self) -> String {
        [
            self.manufacturer.as_str(),
            self.model.as_str(),
            self.serial_number.as_str(),
            self.firmware.as_str(),
        ]
        .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_no_error_sentinel() {
        assert!(!check_fault("+0", "").unwrap());
        assert!(!check_fault("+0\n", "channel_off").unwrap());
    }

    #[traced_test]
    #[test]
    fn test_fault_carries_code_and_tag() {
        let err = check_fault("-113,\"Undefined header\"", "source_dcv").unwrap_err();
        match err {
            SmuError::DeviceFault { code, tag } => {
                assert_eq!(code, "-113,\"Undefined header\"");
                assert_eq!(tag, "source_dcv");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(logs_contain("SCPI error"));
        assert!(logs_contain("source_dcv"));
    }

    #[test]
    fn test_fault_on_near_sentinels() {
        for status in ["0", "+00", "+1", "", "-0"] {
            assert!(check_fault(status, "x").is_err(), "{status:?} should fault");
        }
    }

    #[test]
    fn test_parse_scientific_list() {
        let values = parse_f64_list("+1.000000E+00,-2.5E-03, 3\n").unwrap();
        assert_eq!(values, vec![1.0, -0.0025, 3.0]);
        assert!(parse_f64_list("\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_numeric_token() {
        let err = parse_f64_list("1.0,abc,2.0").unwrap_err();
        match err {
            SmuError::Parse { token, response } => {
                assert_eq!(token, "abc");
                assert_eq!(response, "1.0,abc,2.0");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(parse_f64("volts").is_err());
    }

    #[test]
    fn test_status_byte() {
        assert_eq!(parse_status_byte("+0\n").unwrap(), 0);
        assert_eq!(parse_status_byte("+64").unwrap(), 64);
        assert_eq!(parse_status_byte("128").unwrap(), 128);
        assert!(parse_status_byte("+300").is_err());
    }

    #[test]
    fn test_format_list() {
        assert_eq!(format_list(&[1.8, 1.805, 2.0]), "1.8,1.805,2");
        assert_eq!(format_list(&[0.0, 0.0]), "0,0");
        assert_eq!(format_list(&[]), "");
    }

    #[test]
    fn test_identity() {
        let id =
            Identity::parse("Keysight Technologies,B2902A,MY51144607,3.4.2011.5100\n").unwrap();
        assert_eq!(id.model, "B2902A");
        assert_eq!(id.serial_number, "MY51144607");
        assert_eq!(
            id.id_string(),
            "Keysight Technologies,B2902A,MY51144607,3.4.2011.5100"
        );
        assert!(Identity::parse("Keysight").is_err());
    }
}
