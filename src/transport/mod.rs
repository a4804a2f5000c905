//! Request/response channels to instruments.
//!
//! [`ScpiTransport`] abstracts one open channel: write-only commands and
//! single-line queries. [`Connector`] opens channels by resource address and,
//! where the backend supports it, lists the resources it can see.
//!
//! Implementations:
//! - [`TcpConnector`] - raw SCPI socket (port 5025 on Keysight instruments)
//! - `VisaConnector` - VISA library via `visa-rs` (feature `instrument_visa`)
//! - [`MockConnector`] - scripted in-memory replies for tests and demos

pub mod mock;
pub mod tcp;
#[cfg(feature = "instrument_visa")]
pub mod visa;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use mock::{MockConnector, MockTransport};
pub use tcp::{TcpConnector, TcpTransport};
#[cfg(feature = "instrument_visa")]
pub use visa::{VisaConnector, VisaTransport};

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: &str = "\n";

/// One open channel to an instrument.
///
/// Replies are returned with the line terminator trimmed.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without reading a reply.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a query and read one reply line.
    async fn query(&self, command: &str) -> Result<String>;

    /// Release the channel.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Resource address this channel was opened on.
    fn address(&self) -> &str;
}

/// Opens [`ScpiTransport`]s by resource address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel with the given I/O timeout.
    async fn open(&self, address: &str, timeout: Duration) -> Result<Box<dyn ScpiTransport>>;

    /// Resource addresses visible to this connector.
    ///
    /// Backends without discovery return an empty list.
    async fn list_resources(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Read one reply line from a blocking reader, terminator trimmed.
///
/// The reader must outlive the call: bytes it buffered past this line belong
/// to the next reply.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
pub(crate) fn read_reply<R: std::io::BufRead>(reader: &mut R) -> std::io::Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "channel closed before a reply",
        ));
    }
    Ok(line.trim().to_string())
}

/// Connector used when the configuration does not ask for the mock driver.
pub fn default_connector() -> Box<dyn Connector> {
    #[cfg(feature = "instrument_visa")]
    {
        Box::new(VisaConnector)
    }

    #[cfg(not(feature = "instrument_visa"))]
    {
        Box::new(TcpConnector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn test_replies_buffered_together_are_read_in_order() {
        // Two replies arriving in one read
        let mut reader = BufReader::new(Cursor::new(b"+3.3\n+0\n".to_vec()));
        assert_eq!(read_reply(&mut reader).unwrap(), "+3.3");
        assert_eq!(read_reply(&mut reader).unwrap(), "+0");

        let err = read_reply(&mut reader).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_reply_terminators_trimmed() {
        let mut reader = BufReader::new(Cursor::new(b"+1.0E-3\r\n".to_vec()));
        assert_eq!(read_reply(&mut reader).unwrap(), "+1.0E-3");
    }
}
