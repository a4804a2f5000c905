//! Integration tests for the offline mock SMU
//!
//! Every operation returns its fixed placeholder, whatever the input.

use keysight_smu::config::{CalibrationStatus, SmuConfig};
use keysight_smu::smu::{
    self, Aperture, Channel, MeasureOptions, Reading, ScanOptions, SourceMeter,
};
use std::time::Duration;

fn mock() -> Box<dyn SourceMeter> {
    let config = SmuConfig {
        mock: true,
        calibration_expiration: Some("19990101".to_string()),
        ..Default::default()
    };
    smu::build("smu_mock", &config)
}

#[tokio::test]
async fn test_mock_readings_are_zero() {
    let mut smu = mock();
    smu.open(Duration::from_secs(1)).await.unwrap();
    assert!(smu.is_open());

    let zero = Reading::default();
    for channel in Channel::ALL {
        assert_eq!(smu.source_voltage(channel, 5.0, 0.1).await.unwrap(), zero);
        assert_eq!(smu.source_current(channel, -0.01, 20.0).await.unwrap(), zero);
        let options = MeasureOptions {
            four_wire: true,
            current_range: Some(1.0),
            aperture: Some(Aperture::Auto),
        };
        assert_eq!(
            smu.measure(channel, Duration::from_secs(10), &options)
                .await
                .unwrap(),
            zero
        );
        smu.channel_off(channel).await.unwrap();
    }

    smu.reset().await.unwrap();
    smu.close().await.unwrap();
    assert!(!smu.is_open());
}

#[tokio::test]
async fn test_mock_scan_and_acquire() {
    let smu = mock();
    let status = smu
        .start_scan(
            Channel::Ch2,
            1000,
            Duration::from_secs(1),
            &ScanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(status, 0);

    let data = smu.fetch_scan(Channel::Ch2).await.unwrap();
    assert_eq!(data.voltage, vec![0.0]);
    assert_eq!(data.current, vec![0.0]);

    let sense = smu
        .source_voltage_acquire(Channel::Ch1, 1.0, 0.1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(sense, vec![0.0]);
}

#[tokio::test]
async fn test_mock_sweep_matches_requested_length() {
    let smu = mock();
    let voltages: Vec<f64> = (0..120).map(|i| 1.8 + f64::from(i) * 0.005).collect();
    let tracks = smu
        .dual_channel_sweep(&voltages, Duration::from_millis(40))
        .await
        .unwrap();
    assert_eq!(tracks.len(), 120);
    assert!(tracks.ch1_voltage.iter().all(|v| *v == 0.0));
    assert!(tracks.ch2_current.iter().all(|v| *v == 0.0));
}

#[tokio::test]
async fn test_mock_status_and_identity() {
    let smu = mock();
    assert_eq!(smu.error_query().await.unwrap(), "+0");
    assert!(!smu.check_fault("-222", "anything").unwrap());
    assert_eq!(smu.id_string().unwrap(), "Mock Keysight SMU");
    // Expiry in the past still reports valid
    assert_eq!(smu.calibration_status(), CalibrationStatus::Valid);
}
