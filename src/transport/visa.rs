//! SCPI over a VISA session
//!
//! Uses the system VISA library through `visa-rs`, so USB and GPIB resources
//! work as well as `TCPIP` ones. VISA calls block; every call runs on
//! `spawn_blocking` with the session behind a std mutex. The session keeps
//! one buffered reader for its whole life, so bytes read ahead of a reply are
//! not lost.

use super::{read_reply, Connector, ScpiTransport, LINE_TERMINATOR};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufReader, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use visa_rs::prelude::*;

/// Resource pattern used for discovery.
const RESOURCE_PATTERN: &str = "?*INSTR";

struct Session {
    // Closing the resource manager closes its sessions, so it lives as long
    // as the instrument.
    _rm: DefaultRM,
    instrument: BufReader<Instrument>,
}

/// SCPI channel over a VISA instrument session.
pub struct VisaTransport {
    address: String,
    session: Arc<Mutex<Session>>,
}

impl VisaTransport {
    /// Open `address` through the default resource manager.
    pub async fn open(address: &str, timeout: Duration) -> Result<Self> {
        let resource = address.to_string();
        let session = tokio::task::spawn_blocking(move || -> Result<Session> {
            let rm = DefaultRM::new()
                .map_err(|e| anyhow!("Failed to create VISA resource manager: {:?}", e))?;
            let name = CString::new(resource.clone())
                .with_context(|| format!("Invalid VISA resource string: {}", resource))?;
            let instrument = rm
                .open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| anyhow!("Failed to open VISA resource {}: {:?}", resource, e))?;
            Ok(Session {
                _rm: rm,
                instrument: BufReader::new(instrument),
            })
        })
        .await
        .context("VISA open task panicked")??;

        tracing::info!(address, "Opened VISA session");

        Ok(Self {
            address: address.to_string(),
            session: Arc::new(Mutex::new(session)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut guard)
        })
        .await
        .context("VISA I/O task panicked")?
    }
}

fn send(session: &mut Session, command: &str) -> Result<()> {
    let line = format!("{}{}", command, LINE_TERMINATOR);
    session
        .instrument
        .get_mut()
        .write_all(line.as_bytes())
        .with_context(|| format!("VISA write failed for: {}", command))
}

#[async_trait]
impl ScpiTransport for VisaTransport {
    async fn write(&self, command: &str) -> Result<()> {
        tracing::debug!(command, "VISA write");
        let command = command.to_string();
        self.run(move |session| send(session, &command)).await
    }

    async fn query(&self, command: &str) -> Result<String> {
        tracing::debug!(command, "VISA query");
        let command = command.to_string();
        let response = self
            .run(move |session| {
                send(session, &command)?;
                read_reply(&mut session.instrument)
                    .with_context(|| format!("VISA read failed for: {}", command))
            })
            .await?;
        tracing::debug!(response = %response, "VISA response");
        Ok(response)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Opens [`VisaTransport`]s and lists VISA resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct VisaConnector;

#[async_trait]
impl Connector for VisaConnector {
    async fn open(&self, address: &str, timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
        Ok(Box::new(VisaTransport::open(address, timeout).await?))
    }

    async fn list_resources(&self) -> Result<Vec<String>> {
        tokio::task::spawn_blocking(|| -> Result<Vec<String>> {
            let rm = DefaultRM::new()
                .map_err(|e| anyhow!("Failed to create VISA resource manager: {:?}", e))?;
            let pattern = CString::new(RESOURCE_PATTERN).context("Invalid resource pattern")?;
            let mut list = rm
                .find_res_list(&pattern.into())
                .map_err(|e| anyhow!("VISA resource search failed: {:?}", e))?;

            let mut resources = Vec::new();
            while let Some(resource) = list
                .find_next()
                .map_err(|e| anyhow!("VISA resource search failed: {:?}", e))?
            {
                resources.push(resource.to_string());
            }
            tracing::debug!(count = resources.len(), "Listed VISA resources");
            Ok(resources)
        })
        .await
        .context("VISA discovery task panicked")?
    }
}
