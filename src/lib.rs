//! # Keysight SMU Driver
//!
//! Driver for Keysight B2901A/B2902A source-measure units. Operations are
//! sent as SCPI text over a request/response channel and every command batch
//! is followed by an error query, so instrument faults surface as typed errors
//! instead of silently corrupting the readings that follow.
//!
//! ## Crate Structure
//!
//! - **`smu`**: The `SourceMeter` capability trait, the `KeysightSmu` driver,
//!   the offline `MockSmu`, and the `build` factory that picks one from config.
//! - **`transport`**: The `ScpiTransport` channel trait with TCP, VISA
//!   (feature `instrument_visa`) and scripted mock implementations.
//! - **`scpi`**: Response parsing and the `+0` fault check.
//! - **`config`**: Hardware configuration loaded with figment from TOML and
//!   `SMU_`-prefixed environment variables.
//! - **`error`**: The `SmuError` enum returned by every driver operation.
//! - **`logging`**: tracing subscriber setup for binaries.
//! - **`table`**: Markdown-style text tables for printing sweep results.

pub mod config;
pub mod error;
pub mod logging;
pub mod scpi;
pub mod smu;
pub mod table;
pub mod transport;

pub use config::{CalibrationStatus, HardwareConfig, SmuConfig};
pub use error::{SmuError, SmuResult};
pub use smu::{Channel, KeysightSmu, MockSmu, Reading, SourceMeter};
