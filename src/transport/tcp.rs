//! SCPI over a raw TCP socket
//!
//! Keysight B2900-series instruments accept SCPI on TCP port 5025. VISA-style
//! `TCPIP` resource strings are mapped onto that socket so configurations
//! written for VISA work unchanged:
//!
//! - `TCPIP0::192.168.50.4::inst0::INSTR` -> `192.168.50.4:5025`
//! - `TCPIP0::192.168.50.4::INSTR` -> `192.168.50.4:5025`
//! - `TCPIP0::192.168.50.4::5025::SOCKET` -> `192.168.50.4:5025`
//! - `192.168.50.4:5025` -> as given

use super::{Connector, ScpiTransport, LINE_TERMINATOR};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default SCPI socket port
pub const DEFAULT_PORT: u16 = 5025;

/// Parse a resource address into host and port.
pub fn parse_socket_address(address: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = address.trim().split("::").collect();

    if parts.len() == 1 {
        let (host, port) = address
            .trim()
            .rsplit_once(':')
            .with_context(|| format!("Missing port in address: {}", address))?;
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in address: {}", address))?;
        return Ok((host.to_string(), port));
    }

    if !parts[0].to_uppercase().starts_with("TCPIP") {
        bail!("Not a TCPIP resource: {}", address);
    }

    match parts.as_slice() {
        [_, host, "INSTR"] => Ok((host.to_string(), DEFAULT_PORT)),
        [_, host, _device, "INSTR"] => Ok((host.to_string(), DEFAULT_PORT)),
        [_, host, port, "SOCKET"] => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid socket port in resource: {}", address))?;
            Ok((host.to_string(), port))
        }
        _ => bail!("Unsupported TCPIP resource string: {}", address),
    }
}

/// SCPI channel over a TCP socket.
///
/// A query that times out leaves its reply unread, so the transport refuses
/// further traffic after a timeout instead of pairing that late reply with the
/// next query. Reopen the session to recover.
pub struct TcpTransport {
    address: String,
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
    desynced: AtomicBool,
}

impl TcpTransport {
    /// Connect to `address` (see module docs for accepted forms).
    pub async fn connect(address: &str, io_timeout: Duration) -> Result<Self> {
        let (host, port) = parse_socket_address(address)?;

        let stream = timeout(io_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        // Commands are short; don't let Nagle batch them.
        stream.set_nodelay(true)?;

        tracing::info!(%host, port, "Connected to SCPI socket");

        Ok(Self {
            address: address.to_string(),
            stream: Mutex::new(BufReader::new(stream)),
            timeout: io_timeout,
            desynced: AtomicBool::new(false),
        })
    }

    fn ensure_in_sync(&self) -> Result<()> {
        if self.desynced.load(Ordering::Acquire) {
            bail!(
                "Session to {} is out of sync after a timed-out query; reconnect",
                self.address
            );
        }
        Ok(())
    }

    async fn send(stream: &mut BufReader<TcpStream>, command: &str) -> Result<()> {
        let line = format!("{}{}", command, LINE_TERMINATOR);
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    async fn write(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        self.ensure_in_sync()?;
        tracing::debug!(command, "SCPI write");
        Self::send(&mut stream, command).await
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;
        self.ensure_in_sync()?;
        tracing::debug!(command, "SCPI query");
        Self::send(&mut stream, command).await?;

        let mut response = String::new();
        match timeout(self.timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => bail!("Connection closed by device"),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::debug!(response = %trimmed, "SCPI response");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => {
                self.desynced.store(true, Ordering::Release);
                tracing::warn!(address = %self.address, command, "SCPI query timed out");
                bail!("Timeout waiting for response to: {}", command)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream
            .get_mut()
            .shutdown()
            .await
            .context("Failed to shut down socket")
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Opens [`TcpTransport`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, address: &str, timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
        Ok(Box::new(TcpTransport::connect(address, timeout).await?))
    }
}
