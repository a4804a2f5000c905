//! Source-measure unit capability and drivers
//!
//! [`SourceMeter`] is the operation set shared by the real Keysight driver
//! ([`KeysightSmu`]) and the offline stand-in ([`MockSmu`]). [`build`] picks one
//! at construction time from the instrument's `mock` flag, so calling code
//! holds a `Box<dyn SourceMeter>` and never branches on which it got.
//!
//! # Example
//!
//! ```no_run
//! use keysight_smu::config::HardwareConfig;
//! use keysight_smu::smu::{self, Channel, SourceMeter};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HardwareConfig::load()?;
//! let mut smu = smu::build("smu_1", config.instrument("smu_1")?);
//! smu.open(Duration::from_secs(1)).await?;
//! let reading = smu.source_voltage(Channel::Ch1, 3.3, 0.1).await?;
//! println!("{} V, {} A", reading.voltage, reading.current);
//! smu.channel_off(Channel::Ch1).await?;
//! smu.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod keysight;
pub mod mock;

use crate::config::{CalibrationStatus, SmuConfig};
use crate::error::{SmuError, SmuResult};
use crate::transport::default_connector;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use keysight::KeysightSmu;
pub use mock::MockSmu;

/// Output channel of a one- or two-channel SMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Channel {
    /// Channel 1
    Ch1,
    /// Channel 2
    Ch2,
}

impl Channel {
    /// Every channel, in order.
    pub const ALL: [Channel; 2] = [Channel::Ch1, Channel::Ch2];

    /// SCPI channel suffix.
    pub fn number(self) -> u8 {
        match self {
            Channel::Ch1 => 1,
            Channel::Ch2 => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl TryFrom<u8> for Channel {
    type Error = SmuError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Channel::Ch1),
            2 => Ok(Channel::Ch2),
            other => Err(SmuError::InvalidChannel(other.to_string())),
        }
    }
}

impl FromStr for Channel {
    type Err = SmuError;

    /// Accepts `1`, `2`, `ch1`, `CH2` and so on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .get(..2)
            .filter(|prefix| prefix.eq_ignore_ascii_case("ch"))
            .map_or(trimmed, |_| &trimmed[2..]);
        match digits {
            "1" => Ok(Channel::Ch1),
            "2" => Ok(Channel::Ch2),
            _ => Err(SmuError::InvalidChannel(s.to_string())),
        }
    }
}

/// One voltage/current reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Reading {
    /// Volts
    pub voltage: f64,
    /// Amps
    pub current: f64,
}

/// Integration time for a measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aperture {
    /// Fixed aperture in seconds
    Fixed(f64),
    /// Let the instrument choose
    Auto,
}

/// Optional sense settings applied before a measurement.
#[derive(Debug, Clone, Default)]
pub struct MeasureOptions {
    /// Enable remote (4-wire) sensing
    pub four_wire: bool,
    /// Upper limit of the current range (A); `None` leaves it unchanged
    pub current_range: Option<f64>,
    /// Aperture; `None` leaves it unchanged
    pub aperture: Option<Aperture>,
}

/// Settings for a timed acquisition.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Current aperture in seconds
    pub aperture: f64,
    /// Fixed current range (A); `None` selects auto-ranging
    pub current_range: Option<f64>,
    /// Enable remote (4-wire) sensing
    pub four_wire: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            aperture: 0.005,
            current_range: None,
            four_wire: false,
        }
    }
}

/// Parallel voltage and current samples from a scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScanData {
    /// Volts, one per trigger
    pub voltage: Vec<f64>,
    /// Amps, one per trigger
    pub current: Vec<f64>,
}

/// The four tracks of a dual-channel sweep, one value per sweep step.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SweepTracks {
    /// Channel 1 voltage
    pub ch1_voltage: Vec<f64>,
    /// Channel 1 current
    pub ch1_current: Vec<f64>,
    /// Channel 2 voltage
    pub ch2_voltage: Vec<f64>,
    /// Channel 2 current
    pub ch2_current: Vec<f64>,
}

impl SweepTracks {
    /// Number of values per step in a sweep reply.
    pub const VALUES_PER_STEP: usize = 4;

    /// Split a flat sweep reply into tracks.
    ///
    /// The instrument emits ch1 V, ch1 I, ch2 V, ch2 I for each step in turn,
    /// so track `t` at step `s` is `flat[4 * s + t]`. The reply must hold
    /// exactly four values per step.
    pub fn from_interleaved(flat: &[f64], steps: usize) -> SmuResult<Self> {
        let expected = steps * Self::VALUES_PER_STEP;
        if flat.len() != expected {
            return Err(SmuError::SweepShape {
                expected,
                actual: flat.len(),
            });
        }

        let track = |t: usize| -> Vec<f64> {
            flat.chunks_exact(Self::VALUES_PER_STEP)
                .map(|step| step[t])
                .collect()
        };
        Ok(Self {
            ch1_voltage: track(0),
            ch1_current: track(1),
            ch2_voltage: track(2),
            ch2_current: track(3),
        })
    }

    /// Zero-filled tracks of `steps` values.
    pub fn zeros(steps: usize) -> Self {
        Self {
            ch1_voltage: vec![0.0; steps],
            ch1_current: vec![0.0; steps],
            ch2_voltage: vec![0.0; steps],
            ch2_current: vec![0.0; steps],
        }
    }

    /// Number of sweep steps.
    pub fn len(&self) -> usize {
        self.ch1_voltage.len()
    }

    /// True when the sweep had no steps.
    pub fn is_empty(&self) -> bool {
        self.ch1_voltage.is_empty()
    }

    /// Rows of `[step, ch1 V, ch1 I, ch2 V, ch2 I]` as text, header first.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        let mut rows = vec![vec![
            "step".to_string(),
            "ch1_voltage".to_string(),
            "ch1_current".to_string(),
            "ch2_voltage".to_string(),
            "ch2_current".to_string(),
        ]];
        for s in 0..self.len() {
            rows.push(vec![
                s.to_string(),
                self.ch1_voltage[s].to_string(),
                self.ch1_current[s].to_string(),
                self.ch2_voltage[s].to_string(),
                self.ch2_current[s].to_string(),
            ]);
        }
        rows
    }
}

/// Operations of a two-channel source-measure unit.
///
/// # Contract
/// - Calls are sequential; none may overlap on one session
/// - Every command batch is followed by an error query, and a nonzero reply
///   aborts the operation with [`SmuError::DeviceFault`]
/// - Settle times are open-loop sleeps
#[async_trait]
pub trait SourceMeter: Send + Sync {
    /// Locate and open the instrument, reset it and read its identity.
    ///
    /// Failure is retried once after `retry_delay`.
    async fn open(&mut self, retry_delay: Duration) -> SmuResult<()>;

    /// Release the session. Closing twice is a no-op.
    async fn close(&mut self) -> SmuResult<()>;

    /// True while a session is open.
    fn is_open(&self) -> bool;

    /// Switch both outputs off, then `*RST`. No-op when closed.
    async fn reset(&mut self) -> SmuResult<()>;

    /// Identity string from `*IDN?`.
    fn id_string(&self) -> SmuResult<String>;

    /// Calibration status from the configured expiry date.
    fn calibration_status(&self) -> CalibrationStatus;

    /// Source `volts` with a `current_limit` compliance and read back.
    async fn source_voltage(
        &self,
        channel: Channel,
        volts: f64,
        current_limit: f64,
    ) -> SmuResult<Reading>;

    /// Source `amps` with a `voltage_limit` compliance and read back.
    async fn source_current(
        &self,
        channel: Channel,
        amps: f64,
        voltage_limit: f64,
    ) -> SmuResult<Reading>;

    /// Source `volts`, trigger one acquisition and return the raw sense data.
    async fn source_voltage_acquire(
        &self,
        channel: Channel,
        volts: f64,
        current_limit: f64,
        settle: Duration,
    ) -> SmuResult<Vec<f64>>;

    /// Apply `options`, wait `settle`, then read voltage and current.
    async fn measure(
        &self,
        channel: Channel,
        settle: Duration,
        options: &MeasureOptions,
    ) -> SmuResult<Reading>;

    /// Switch an output off.
    async fn channel_off(&self, channel: Channel) -> SmuResult<()>;

    /// Start `count` timed acquisitions `period` apart; returns the status byte.
    async fn start_scan(
        &self,
        channel: Channel,
        count: u32,
        period: Duration,
        options: &ScanOptions,
    ) -> SmuResult<u8>;

    /// Fetch the samples of the last scan on `channel`.
    async fn fetch_scan(&self, channel: Channel) -> SmuResult<ScanData>;

    /// Step channel 1 through `voltages` while channel 2 holds zero current,
    /// sampling both channels every `aperture`.
    async fn dual_channel_sweep(
        &self,
        voltages: &[f64],
        aperture: Duration,
    ) -> SmuResult<SweepTracks>;

    /// Raw reply to the error query.
    async fn error_query(&self) -> SmuResult<String>;

    /// Check an error-query reply; see [`crate::scpi::check_fault`].
    fn check_fault(&self, status: &str, tag: &str) -> SmuResult<bool>;
}

/// Construct the driver for instrument `id`.
///
/// `mock = true` yields a [`MockSmu`]; otherwise a [`KeysightSmu`] on the
/// default connector.
pub fn build(id: &str, config: &SmuConfig) -> Box<dyn SourceMeter> {
    if config.mock {
        tracing::info!(instrument = id, "Creating mock Keysight SMU");
        Box::new(MockSmu::new(id))
    } else {
        tracing::info!(instrument = id, "Creating Keysight SMU driver");
        Box::new(KeysightSmu::new(id, config.clone(), default_connector()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parsing() {
        assert_eq!(Channel::try_from(1).unwrap(), Channel::Ch1);
        assert_eq!(Channel::try_from(2).unwrap(), Channel::Ch2);
        assert!(matches!(
            Channel::try_from(3),
            Err(SmuError::InvalidChannel(_))
        ));

        assert_eq!("1".parse::<Channel>().unwrap(), Channel::Ch1);
        assert_eq!("ch2".parse::<Channel>().unwrap(), Channel::Ch2);
        assert_eq!("CH1".parse::<Channel>().unwrap(), Channel::Ch1);
        assert_eq!(" 2 ".parse::<Channel>().unwrap(), Channel::Ch2);
        for bad in ["0", "3", "ch", "channel1", "", "é"] {
            assert!(bad.parse::<Channel>().is_err(), "{bad:?} should be rejected");
        }
        assert_eq!(Channel::Ch2.to_string(), "2");
    }

    #[test]
    fn test_sweep_reshape_interleaved() {
        // Two steps: (1.8 V, 1 mA, 0.7 V, 0 A), (1.9 V, 2 mA, 0.8 V, 0 A)
        let flat = [1.8, 0.001, 0.7, 0.0, 1.9, 0.002, 0.8, 0.0];
        let tracks = SweepTracks::from_interleaved(&flat, 2).unwrap();
        assert_eq!(tracks.ch1_voltage, vec![1.8, 1.9]);
        assert_eq!(tracks.ch1_current, vec![0.001, 0.002]);
        assert_eq!(tracks.ch2_voltage, vec![0.7, 0.8]);
        assert_eq!(tracks.ch2_current, vec![0.0, 0.0]);
        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn test_sweep_reshape_rejects_short_reply() {
        let err = SweepTracks::from_interleaved(&[1.0; 7], 2).unwrap_err();
        assert!(matches!(
            err,
            SmuError::SweepShape {
                expected: 8,
                actual: 7
            }
        ));
        assert!(SweepTracks::from_interleaved(&[1.0; 12], 2).is_err());
    }

    #[test]
    fn test_sweep_rows() {
        let rows = SweepTracks::zeros(3).to_rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0][0], "step");
        assert_eq!(rows[3], vec!["2", "0", "0", "0", "0"]);
    }

    #[test]
    fn test_build_selects_mock() {
        let config = SmuConfig {
            mock: true,
            ..Default::default()
        };
        let smu = build("smu_1", &config);
        assert_eq!(smu.id_string().unwrap(), "Mock Keysight SMU");
        assert_eq!(smu.calibration_status(), CalibrationStatus::Valid);
    }

    #[test]
    fn test_build_selects_real_driver() {
        let config = SmuConfig {
            ip_address: Some("192.168.50.4".to_string()),
            ..Default::default()
        };
        let smu = build("smu_1", &config);
        assert!(!smu.is_open());
        assert!(matches!(smu.id_string(), Err(SmuError::NotConnected)));
    }
}
