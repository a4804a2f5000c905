//! Offline SMU that returns constant readings.
//!
//! Never opens a transport and never fails. Useful for exercising calling
//! code without an instrument on the bench.

use super::{Channel, MeasureOptions, Reading, ScanData, ScanOptions, SourceMeter, SweepTracks};
use crate::config::CalibrationStatus;
use crate::error::SmuResult;
use crate::scpi::NO_ERROR;
use async_trait::async_trait;
use std::time::Duration;

/// Identity reported by [`MockSmu`].
pub const MOCK_ID: &str = "Mock Keysight SMU";

/// Stand-in SMU with fixed zero readings.
#[derive(Debug, Clone)]
pub struct MockSmu {
    id: String,
    open: bool,
}

impl MockSmu {
    /// Create a mock for instrument `id`.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            open: false,
        }
    }

    /// Unique identifier from the hardware configuration.
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl SourceMeter for MockSmu {
    async fn open(&mut self, _retry_delay: Duration) -> SmuResult<()> {
        tracing::debug!(instrument = %self.id, "Mock SMU opened");
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> SmuResult<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn reset(&mut self) -> SmuResult<()> {
        Ok(())
    }

    fn id_string(&self) -> SmuResult<String> {
        Ok(MOCK_ID.to_string())
    }

    fn calibration_status(&self) -> CalibrationStatus {
        CalibrationStatus::Valid
    }

    async fn source_voltage(&self, _: Channel, _: f64, _: f64) -> SmuResult<Reading> {
        Ok(Reading::default())
    }

    async fn source_current(&self, _: Channel, _: f64, _: f64) -> SmuResult<Reading> {
        Ok(Reading::default())
    }

    async fn source_voltage_acquire(
        &self,
        _: Channel,
        _: f64,
        _: f64,
        _: Duration,
    ) -> SmuResult<Vec<f64>> {
        Ok(vec![0.0])
    }

    async fn measure(&self, _: Channel, _: Duration, _: &MeasureOptions) -> SmuResult<Reading> {
        Ok(Reading::default())
    }

    async fn channel_off(&self, _: Channel) -> SmuResult<()> {
        Ok(())
    }

    async fn start_scan(&self, _: Channel, _: u32, _: Duration, _: &ScanOptions) -> SmuResult<u8> {
        Ok(0)
    }

    async fn fetch_scan(&self, _: Channel) -> SmuResult<ScanData> {
        Ok(ScanData {
            voltage: vec![0.0],
            current: vec![0.0],
        })
    }

    async fn dual_channel_sweep(
        &self,
        voltages: &[f64],
        _: Duration,
    ) -> SmuResult<SweepTracks> {
        Ok(SweepTracks::zeros(voltages.len()))
    }

    async fn error_query(&self) -> SmuResult<String> {
        Ok(NO_ERROR.to_string())
    }

    fn check_fault(&self, _: &str, _: &str) -> SmuResult<bool> {
        Ok(false)
    }
}
