//! CLI entry point for the Keysight SMU driver
//!
//! Opens one configured instrument, runs a single operation and closes it.
//!
//! # Usage
//!
//! ```bash
//! smu --instrument smu_1 identify
//! smu source-voltage 1 3.3 --current-limit 0.1
//! smu sweep --start 1.8 --step 0.005 --steps 120 --aperture 0.04
//! smu --mock --json measure 2
//! ```

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use keysight_smu::config::{HardwareConfig, SmuConfig, DEFAULT_CONFIG_PATH};
use keysight_smu::logging::{self, parse_log_level, LoggingConfig, OutputFormat};
use keysight_smu::smu::{self, Aperture, Channel, MeasureOptions, ScanOptions, SourceMeter};
use keysight_smu::table::markdown_table;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Delay before the single connection retry.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "smu")]
#[command(about = "Control Keysight B2900-series source-measure units", long_about = None)]
struct Cli {
    /// Hardware configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Instrument identifier in the configuration
    #[arg(long, short, global = true, default_value = "smu_1")]
    instrument: String,

    /// Use the offline mock instead of the instrument
    #[arg(long, global = true)]
    mock: bool,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print results (and logs) as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the instrument identity
    Identify,

    /// Source a voltage and read back voltage and current
    SourceVoltage {
        /// Channel (1, 2, ch1, ch2)
        channel: Channel,
        /// Output level in volts
        volts: f64,
        /// Current compliance in amps
        #[arg(long, default_value_t = 0.1)]
        current_limit: f64,
    },

    /// Source a current and read back voltage and current
    SourceCurrent {
        /// Channel (1, 2, ch1, ch2)
        channel: Channel,
        /// Output level in amps
        amps: f64,
        /// Voltage compliance in volts
        #[arg(long, default_value_t = 10.0)]
        voltage_limit: f64,
    },

    /// Read voltage and current without changing the source
    Measure {
        /// Channel (1, 2, ch1, ch2)
        channel: Channel,
        /// Wait before reading, in milliseconds
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
        /// Enable 4-wire sensing
        #[arg(long)]
        four_wire: bool,
        /// Current range upper limit in amps
        #[arg(long)]
        current_range: Option<f64>,
        /// Fixed aperture in seconds
        #[arg(long, conflicts_with = "auto_aperture")]
        aperture: Option<f64>,
        /// Let the instrument choose the aperture
        #[arg(long)]
        auto_aperture: bool,
    },

    /// Switch outputs off (both channels when none is given)
    Off {
        /// Channel (1, 2, ch1, ch2)
        channel: Option<Channel>,
    },

    /// Run a timed acquisition and print the samples
    Scan {
        /// Channel (1, 2, ch1, ch2)
        channel: Channel,
        /// Number of samples
        #[arg(long, default_value_t = 60)]
        count: u32,
        /// Sample period in seconds
        #[arg(long, default_value = "0.01", value_parser = parse_seconds)]
        period: Duration,
        /// Current aperture in seconds
        #[arg(long, default_value = "0.005", value_parser = parse_seconds)]
        aperture: Duration,
        /// Fixed current range in amps (auto-range when omitted)
        #[arg(long)]
        current_range: Option<f64>,
        /// Enable 4-wire sensing
        #[arg(long)]
        four_wire: bool,
    },

    /// Step channel 1 through a voltage list while sensing both channels
    Sweep {
        /// First voltage
        #[arg(long)]
        start: f64,
        /// Voltage increment per step
        #[arg(long)]
        step: f64,
        /// Number of steps
        #[arg(long)]
        steps: usize,
        /// Time per step in seconds
        #[arg(long, default_value = "0.04", value_parser = parse_seconds)]
        aperture: Duration,
    },

    /// Report calibration status
    Calibration,

    /// Print the raw error queue reply
    Error,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let hardware = HardwareConfig::load_from(&cli.config)?;
    hardware.validate()?;

    let level = cli.log_level.as_deref().unwrap_or(&hardware.log_level);
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Compact
    };
    logging::init(
        LoggingConfig::new(parse_log_level(level).map_err(|e| anyhow!(e))?).with_format(format),
    )
    .map_err(|e| anyhow!(e))?;

    let mut instrument = match hardware.instrument(&cli.instrument) {
        Ok(config) => config.clone(),
        Err(_) if cli.mock => SmuConfig::default(),
        Err(e) => return Err(e.into()),
    };
    if cli.mock {
        instrument.mock = true;
    }

    let mut smu = smu::build(&cli.instrument, &instrument);
    smu.open(RETRY_DELAY).await?;
    if !smu.is_open() {
        bail!(
            "Instrument '{}' has no address or serial number in {}",
            cli.instrument,
            cli.config.display()
        );
    }

    let result = run(&cli, &instrument, smu.as_ref()).await;
    smu.close().await?;
    result
}

async fn run(cli: &Cli, config: &SmuConfig, smu: &dyn SourceMeter) -> Result<()> {
    match &cli.command {
        Commands::Identify => {
            let id = smu.id_string()?;
            emit(cli.json, &serde_json::json!({ "identity": id }), || id.clone())
        }
        Commands::SourceVoltage {
            channel,
            volts,
            current_limit,
        } => {
            let reading = smu.source_voltage(*channel, *volts, *current_limit).await?;
            emit(cli.json, &reading, || {
                format!("{} V, {} A", reading.voltage, reading.current)
            })
        }
        Commands::SourceCurrent {
            channel,
            amps,
            voltage_limit,
        } => {
            let reading = smu.source_current(*channel, *amps, *voltage_limit).await?;
            emit(cli.json, &reading, || {
                format!("{} V, {} A", reading.voltage, reading.current)
            })
        }
        Commands::Measure {
            channel,
            settle_ms,
            four_wire,
            current_range,
            aperture,
            auto_aperture,
        } => {
            let options = MeasureOptions {
                four_wire: *four_wire,
                current_range: *current_range,
                aperture: if *auto_aperture {
                    Some(Aperture::Auto)
                } else {
                    aperture.map(Aperture::Fixed)
                },
            };
            let reading = smu
                .measure(*channel, Duration::from_millis(*settle_ms), &options)
                .await?;
            emit(cli.json, &reading, || {
                format!("{} V, {} A", reading.voltage, reading.current)
            })
        }
        Commands::Off { channel } => {
            let channels = match channel {
                Some(channel) => vec![*channel],
                None => Channel::ALL.to_vec(),
            };
            for channel in &channels {
                smu.channel_off(*channel).await?;
            }
            emit(cli.json, &serde_json::json!({ "off": channels }), || {
                format!("Output off on {} channel(s)", channels.len())
            })
        }
        Commands::Scan {
            channel,
            count,
            period,
            aperture,
            current_range,
            four_wire,
        } => {
            let options = ScanOptions {
                aperture: aperture.as_secs_f64(),
                current_range: *current_range,
                four_wire: *four_wire,
            };
            let duration = period
                .checked_mul(*count)
                .ok_or_else(|| anyhow!("Scan of {} samples at {:?} is too long", count, period))?;
            let status = smu.start_scan(*channel, *count, *period, &options).await?;
            tracing::debug!(status, "Scan started");
            tokio::time::sleep(duration).await;
            let data = smu.fetch_scan(*channel).await?;
            emit(cli.json, &data, || {
                let mut rows = vec![vec![
                    "sample".to_string(),
                    "voltage".to_string(),
                    "current".to_string(),
                ]];
                rows.extend(data.voltage.iter().zip(&data.current).enumerate().map(
                    |(i, (v, c))| vec![i.to_string(), v.to_string(), c.to_string()],
                ));
                markdown_table(&rows).0
            })
        }
        Commands::Sweep {
            start,
            step,
            steps,
            aperture,
        } => {
            let voltages: Vec<f64> = (0..*steps).map(|i| start + i as f64 * step).collect();
            let tracks = smu
                .dual_channel_sweep(&voltages, *aperture)
                .await?;
            emit(cli.json, &tracks, || markdown_table(&tracks.to_rows()).0)
        }
        Commands::Calibration => {
            let status = smu.calibration_status();
            let expiration = config.calibration_expiration.clone();
            emit(
                cli.json,
                &serde_json::json!({ "status": status, "expiration": expiration }),
                || match &expiration {
                    Some(date) => format!("{:?} (expires {})", status, date),
                    None => format!("{:?}", status),
                },
            )
        }
        Commands::Error => {
            let reply = smu.error_query().await?;
            emit(cli.json, &serde_json::json!({ "error": reply }), || {
                reply.clone()
            })
        }
    }
}

/// Parse a positive, finite number of seconds.
fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|e| format!("'{}' is not a number: {}", value, e))?;
    if seconds <= 0.0 {
        return Err(format!("'{}' must be greater than zero", value));
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("'{}': {}", value, e))
}

/// Print `value` as JSON, or the text produced by `text`.
fn emit<T, F>(json: bool, value: &T, text: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text().trim_end());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("0.04").unwrap(), Duration::from_millis(40));
        assert_eq!(parse_seconds("2").unwrap(), Duration::from_secs(2));
        assert!(parse_seconds("0").is_err());
        assert!(parse_seconds("-0.04").is_err());
        assert!(parse_seconds("NaN").is_err());
        assert!(parse_seconds("inf").is_err());
        assert!(parse_seconds("1e30").is_err());
        assert!(parse_seconds("fast").is_err());
    }

    #[test]
    fn test_negative_sweep_aperture_is_rejected() {
        let result = Cli::try_parse_from([
            "smu", "--mock", "sweep", "--start", "1", "--step", "0.1", "--steps", "3",
            "--aperture=-0.04",
        ]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "smu", "--mock", "sweep", "--start", "1", "--step", "0.1", "--steps", "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Sweep { aperture, .. } => {
                assert_eq!(aperture, Duration::from_millis(40));
            }
            _ => panic!("expected sweep"),
        }
    }

    #[test]
    fn test_scan_period_must_be_positive() {
        assert!(Cli::try_parse_from(["smu", "scan", "1", "--period", "0"]).is_err());
        assert!(Cli::try_parse_from(["smu", "scan", "1", "--aperture", "nan"]).is_err());
        assert!(Cli::try_parse_from(["smu", "scan", "1"]).is_ok());
    }
}
