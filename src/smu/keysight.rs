//! Keysight B2901A/B2902A driver
//!
//! Each operation is a fixed batch of SCPI writes followed by an error query.
//! A reply other than `+0` aborts the operation with a tag naming the batch
//! that failed, so a fault in `source_dcv_0` points at the mode/level writes
//! and one in `source_dcv` at the output enable.

use super::{
    Aperture, Channel, MeasureOptions, Reading, ScanData, ScanOptions, SourceMeter, SweepTracks,
};
use crate::config::{CalibrationStatus, SmuConfig};
use crate::error::{SmuError, SmuResult};
use crate::scpi::{self, Identity, ERROR_QUERY, IDN_QUERY, STB_QUERY};
use crate::transport::{Connector, ScpiTransport};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

/// Readings above this magnitude are the instrument's overflow marker.
const OVERFLOW_THRESHOLD: f64 = 1e30;

/// Driver for one Keysight SMU.
pub struct KeysightSmu {
    id: String,
    config: SmuConfig,
    connector: Box<dyn Connector>,
    session: Option<Box<dyn ScpiTransport>>,
    address: Option<String>,
    identity: Option<Identity>,
    model: Option<String>,
    serial_number: Option<String>,
}

impl KeysightSmu {
    /// Create a closed driver for instrument `id`.
    ///
    /// Missing identification fields are logged; they only become fatal when
    /// `open` cannot locate the instrument.
    pub fn new(id: &str, config: SmuConfig, connector: Box<dyn Connector>) -> Self {
        for field in config.missing_fields() {
            tracing::error!(instrument = id, field, "Missing configuration field");
        }
        Self {
            id: id.to_string(),
            address: config.resolve_address(),
            model: config.model.clone(),
            serial_number: config.serial_number.clone(),
            config,
            connector,
            session: None,
            identity: None,
        }
    }

    /// Unique identifier from the hardware configuration.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resource address, once configured or discovered.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Model from the configuration, replaced by `*IDN?` after `open`.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Serial number from the configuration, replaced by `*IDN?` after `open`.
    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// Parsed identity, available after `open`.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    fn session(&self) -> SmuResult<&dyn ScpiTransport> {
        self.session.as_deref().ok_or(SmuError::NotConnected)
    }

    async fn write(&self, command: &str) -> SmuResult<()> {
        self.session()?.write(command).await?;
        Ok(())
    }

    async fn query(&self, command: &str) -> SmuResult<String> {
        Ok(self.session()?.query(command).await?)
    }

    async fn write_all(&self, commands: &[String]) -> SmuResult<()> {
        for command in commands {
            self.write(command).await?;
        }
        Ok(())
    }

    /// Issue the error query and fail on anything but `+0`.
    async fn check(&self, tag: &str) -> SmuResult<()> {
        let status = self.query(ERROR_QUERY).await?;
        scpi::check_fault(&status, tag)?;
        Ok(())
    }

    /// Find the resource whose name contains the configured serial number.
    async fn discover(&self) -> SmuResult<String> {
        let serial = self.serial_number.as_deref().ok_or_else(|| {
            SmuError::Configuration(format!("No address or serial number for '{}'", self.id))
        })?;
        let resources = self.connector.list_resources().await?;
        tracing::debug!(instrument = %self.id, ?resources, "Searching resources");
        resources
            .into_iter()
            .find(|resource| resource.contains(serial))
            .ok_or_else(|| {
                SmuError::Connection(format!("No resource found for serial number {}", serial))
            })
    }

    async fn connect_once(&self, address: &str) -> SmuResult<(Box<dyn ScpiTransport>, Identity)> {
        let transport = self.connector.open(address, self.config.timeout()).await?;
        match handshake(transport.as_ref()).await {
            Ok(identity) => Ok((transport, identity)),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::debug!(error = %close_err, "Close after failed handshake");
                }
                Err(e)
            }
        }
    }
}

/// `*RST` then `*IDN?`.
async fn handshake(transport: &dyn ScpiTransport) -> SmuResult<Identity> {
    transport.write("*RST").await?;
    let reply = transport.query(IDN_QUERY).await?;
    Identity::parse(&reply)
}

#[async_trait]
impl SourceMeter for KeysightSmu {
    async fn open(&mut self, retry_delay: Duration) -> SmuResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        if !self.config.is_locatable() {
            tracing::error!(instrument = %self.id, "No instrument info; not opening");
            return Ok(());
        }

        let address = match self.address.clone() {
            Some(address) => address,
            None => self.discover().await?,
        };
        self.address = Some(address.clone());

        let (transport, identity) = match self.connect_once(&address).await {
            Ok(connected) => connected,
            Err(first) => {
                tracing::warn!(
                    instrument = %self.id,
                    error = %first,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "SMU connection failed, retrying"
                );
                sleep(retry_delay).await;
                self.connect_once(&address).await.map_err(|e| {
                    tracing::error!(instrument = %self.id, error = %e, "Unable to connect to SMU");
                    SmuError::Connection(format!(
                        "Error connecting to SMU at {}: {}. Check SMU power, network connection, and serial number",
                        address, e
                    ))
                })?
            }
        };

        tracing::info!(
            instrument = %self.id,
            %address,
            model = %identity.model,
            serial_number = %identity.serial_number,
            "Connected to Keysight SMU"
        );
        self.model = Some(identity.model.clone());
        self.serial_number = Some(identity.serial_number.clone());
        self.identity = Some(identity);
        self.session = Some(transport);
        Ok(())
    }

    async fn close(&mut self) -> SmuResult<()> {
        if let Some(session) = self.session.take() {
            session.close().await?;
            tracing::info!(instrument = %self.id, "Closed SMU session");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    async fn reset(&mut self) -> SmuResult<()> {
        if self.session.is_none() {
            return Ok(());
        }
        for channel in Channel::ALL {
            self.channel_off(channel).await?;
        }
        self.write("*RST").await
    }

    fn id_string(&self) -> SmuResult<String> {
        self.identity
            .as_ref()
            .map(Identity::id_string)
            .ok_or(SmuError::NotConnected)
    }

    fn calibration_status(&self) -> CalibrationStatus {
        self.config.calibration_status()
    }

    async fn source_voltage(
        &self,
        channel: Channel,
        volts: f64,
        current_limit: f64,
    ) -> SmuResult<Reading> {
        let n = channel.number();
        tracing::debug!(channel = n, volts, current_limit, "Source voltage");

        self.write_all(&[
            format!(":SOUR{n}:FUNC:MODE VOLT"),
            format!(":SOUR{n}:VOLT:LEV:IMM {volts}"),
            format!(":SOUR{n}:FUNC:SHAP DC"),
        ])
        .await?;
        self.check("source_dcv_0").await?;

        self.write_all(&[
            format!(":SOUR{n}:VOLT:MODE FIX"),
            format!(":SENS{n}:CURR:PROT {current_limit}"),
            format!(":OUTP{n}:STAT ON"),
            format!(":INIT:IMM:TRAN (@{n})"),
        ])
        .await?;
        sleep(self.config.timing.source_voltage_settle()).await;
        self.check("source_dcv").await?;

        self.measure(
            channel,
            self.config.timing.measure_settle(),
            &MeasureOptions::default(),
        )
        .await
    }

    async fn source_current(
        &self,
        channel: Channel,
        amps: f64,
        voltage_limit: f64,
    ) -> SmuResult<Reading> {
        let n = channel.number();
        tracing::debug!(channel = n, amps, voltage_limit, "Source current");

        self.write_all(&[
            format!(":SOUR{n}:FUNC:MODE CURR"),
            format!(":SOUR{n}:CURR:LEV:IMM {amps}"),
            format!(":SOUR{n}:FUNC:SHAP DC"),
            format!(":SOUR{n}:CURR:MODE FIX"),
            format!(":SENS{n}:VOLT:PROT {voltage_limit}"),
        ])
        .await?;
        self.check("source_dci_0").await?;

        self.write_all(&[format!(":OUTP{n}:STAT ON"), format!(":INIT:IMM:TRAN (@{n})")])
            .await?;
        self.check("source_dci_1").await?;

        sleep(self.config.timing.source_current_settle()).await;
        self.check("source_dci").await?;

        self.measure(
            channel,
            self.config.timing.measure_settle(),
            &MeasureOptions::default(),
        )
        .await
    }

    async fn source_voltage_acquire(
        &self,
        channel: Channel,
        volts: f64,
        current_limit: f64,
        settle: Duration,
    ) -> SmuResult<Vec<f64>> {
        let n = channel.number();
        let nplc = self.config.timing.acquire_nplc;

        self.write_all(&[
            format!(":SENS{n}:CURR:PROT {current_limit}"),
            format!(":SENS{n}:REM OFF"),
            format!(":SENS{n}:FUNC:ON \"VOLT\",\"CURR\""),
            format!(":SOUR{n}:VOLT:LEV:IMM {volts}"),
        ])
        .await?;
        self.check("acquire_0").await?;

        self.write_all(&[
            format!(":SOUR{n}:FUNC:MODE VOLT"),
            format!(":SOUR{n}:FUNC:SHAP DC"),
            format!(":SOUR{n}:VOLT:MODE FIX"),
        ])
        .await?;
        self.check("acquire_1").await?;

        self.write_all(&[
            format!(":SENS{n}:CURR:DC:NPLC {nplc}"),
            format!(":OUTP{n}:STAT ON"),
        ])
        .await?;
        self.check("acquire_2").await?;

        self.write(&format!(":INIT:IMM:ACQ (@{n})")).await?;
        sleep(settle).await;
        self.check("acquire_3").await?;

        let reply = self.query(&format!(":SENS{n}:DATA?")).await?;
        scpi::parse_f64_list(&reply)
    }

    async fn measure(
        &self,
        channel: Channel,
        settle: Duration,
        options: &MeasureOptions,
    ) -> SmuResult<Reading> {
        let n = channel.number();

        if options.four_wire {
            self.write(&format!(":SENS{n}:REM ON")).await?;
        }
        if let Some(range) = options.current_range {
            self.write(&format!(":SENS{n}:CURR:DC:RANG:UPP {range}"))
                .await?;
        }
        match options.aperture {
            Some(Aperture::Auto) => {
                self.write(&format!(":SENS{n}:CURR:DC:APER:AUTO ON"))
                    .await?
            }
            Some(Aperture::Fixed(seconds)) => {
                self.write(&format!(":SENS{n}:CURR:DC:APER {seconds}"))
                    .await?
            }
            None => {}
        }

        sleep(settle).await;

        let voltage = scpi::parse_f64(&self.query(&format!(":MEAS:VOLT? (@{n})")).await?)?;
        let current = scpi::parse_f64(&self.query(&format!(":MEAS:CURR? (@{n})")).await?)?;
        tracing::debug!(channel = n, voltage, current, "Measured");
        Ok(Reading { voltage, current })
    }

    async fn channel_off(&self, channel: Channel) -> SmuResult<()> {
        self.write(&format!(":OUTP{}:STAT OFF", channel.number()))
            .await?;
        sleep(self.config.timing.channel_off_settle()).await;
        self.check("channel_off").await
    }

    async fn start_scan(
        &self,
        channel: Channel,
        count: u32,
        period: Duration,
        options: &ScanOptions,
    ) -> SmuResult<u8> {
        let n = channel.number();
        let aperture = options.aperture;
        let period_s = period.as_secs_f64();

        self.check(&format!("scan_0_ch{n}")).await?;

        let remote = if options.four_wire { "ON" } else { "OFF" };
        let range = match options.current_range {
            Some(range) => format!(":SENS{n}:CURR:DC:RANG:UPP {range}"),
            None => format!(":SENS{n}:CURR:RANG:AUTO ON"),
        };
        self.write_all(&[
            format!(":SENS{n}:CURR:APER {aperture}"),
            format!(":SENS{n}:REM {remote}"),
            range,
            format!(":TRIG{n}:ACQ:SOUR TIM"),
        ])
        .await?;
        self.check(&format!("scan_1_ch{n}")).await?;

        self.write_all(&[
            format!(":TRIG{n}:ACQ:TIM {period_s}"),
            format!(":TRIG{n}:ACQ:COUN {count}"),
        ])
        .await?;
        self.check(&format!("scan_2_ch{n}")).await?;

        self.write(&format!(":OUTP{n}:STAT ON")).await?;
        tracing::info!(
            channel = n,
            count,
            period_s,
            "Starting acquisition of V and I readings"
        );
        self.write(&format!(":INIT:ACQ (@{n})")).await?;
        self.check(&format!("scan_3_ch{n}")).await?;

        scpi::parse_status_byte(&self.query(STB_QUERY).await?)
    }

    async fn fetch_scan(&self, channel: Channel) -> SmuResult<ScanData> {
        let n = channel.number();

        let current_reply = self.query(&format!(":FETC:ARR:CURR? (@{n})")).await?;
        self.check("fetch_current").await?;
        let current = scpi::parse_f64_list(&current_reply)?;

        let voltage_reply = self.query(&format!(":FETC:ARR:VOLT? (@{n})")).await?;
        self.check("fetch_voltage").await?;
        let voltage = scpi::parse_f64_list(&voltage_reply)?;

        let overflows = voltage
            .iter()
            .chain(&current)
            .filter(|v| v.abs() > OVERFLOW_THRESHOLD)
            .count();
        if overflows > 0 {
            tracing::warn!(channel = n, overflows, "Scan contains overflow readings");
        }

        Ok(ScanData { voltage, current })
    }

    async fn dual_channel_sweep(
        &self,
        voltages: &[f64],
        aperture: Duration,
    ) -> SmuResult<SweepTracks> {
        if voltages.is_empty() {
            return Err(SmuError::Configuration(
                "Sweep voltage list is empty".to_string(),
            ));
        }
        let steps = voltages.len();
        let step_s = aperture.as_secs_f64();
        let sense_aperture = step_s - self.config.sweep.aperture_margin;
        let ch1_limit = self.config.sweep.ch1_current_compliance;
        let ch2_limit = self.config.sweep.ch2_voltage_compliance;

        self.write_all(&[
            ":SOUR1:FUNC:MODE VOLT".to_string(),
            ":SOUR2:FUNC:MODE CURR".to_string(),
            ":FORM:ELEM:SENS VOLT,CURR".to_string(),
            format!(":SOUR1:LIST:VOLT {}", scpi::format_list(voltages)),
            ":SOUR1:VOLT:MODE LIST".to_string(),
            format!(":SOUR2:LIST:CURR {}", scpi::format_list(&vec![0.0; steps])),
            ":SOUR2:CURR:MODE LIST".to_string(),
            format!(":SENS1:CURR:PROT {ch1_limit}"),
            format!(":SENS2:VOLT:PROT {ch2_limit}"),
        ])
        .await?;
        self.check("sweep_source").await?;

        self.write_all(&[
            ":SENS1:FUNC \"VOLT\",\"CURR\"".to_string(),
            ":SENS2:FUNC \"VOLT\",\"CURR\"".to_string(),
        ])
        .await?;
        self.check("sweep_sense").await?;

        self.write_all(&[
            format!(":SENS1:CURR:APER {sense_aperture}"),
            format!(":SENS2:CURR:APER {sense_aperture}"),
            format!(":SENS1:VOLT:APER {sense_aperture}"),
            format!(":SENS2:VOLT:APER {sense_aperture}"),
        ])
        .await?;
        self.check("sweep_aperture").await?;

        self.write(":TRIG:SOUR TIM").await?;
        self.check("sweep_trigger_source").await?;
        self.write(&format!(":TRIG:TIM {step_s}")).await?;
        self.check("sweep_trigger_timer").await?;
        self.write(&format!(":TRIG:COUN {steps}")).await?;
        self.check("sweep_trigger_count").await?;

        self.write_all(&[":OUTP1 ON".to_string(), ":OUTP2 ON".to_string()])
            .await?;
        self.check("sweep_output").await?;

        self.write(":INIT").await?;
        self.check("sweep_init").await?;

        sleep(aperture.mul_f64(steps as f64)).await;

        let reply = self.query(":FETC:ARR? (@1,2)").await?;
        let flat = scpi::parse_f64_list(&reply)?;
        tracing::debug!(values = flat.len(), steps, "Sweep data read");
        self.check("sweep_fetch").await?;

        SweepTracks::from_interleaved(&flat, steps)
    }

    async fn error_query(&self) -> SmuResult<String> {
        self.query(ERROR_QUERY).await
    }

    fn check_fault(&self, status: &str, tag: &str) -> SmuResult<bool> {
        scpi::check_fault(status, tag)
    }
}
