//! Scripted in-memory transport
//!
//! `MockTransport` records every command it receives and answers queries from
//! a script. Clones share state, so a test can keep one handle while the
//! driver owns another (handed out by [`MockConnector`]).
//!
//! Out of the box the error query answers `+0`, `*IDN?` answers a B2902A
//! identity and `*STB?` answers `+0`. Any other query must be scripted.

use super::{Connector, ScpiTransport};
use crate::scpi::{ERROR_QUERY, IDN_QUERY, NO_ERROR, STB_QUERY};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Identity returned by a fresh mock transport.
pub const MOCK_IDENTITY: &str = "Keysight Technologies,B2902A,MY51144607,3.4.2011.5100";

#[derive(Default)]
struct MockState {
    commands: Vec<String>,
    once: HashMap<String, VecDeque<Result<String, String>>>,
    fixed: HashMap<String, String>,
    write_failures: HashMap<String, String>,
    closed: bool,
}

/// Scripted transport.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    address: String,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a transport with the default replies.
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.fixed.insert(ERROR_QUERY.to_string(), NO_ERROR.to_string());
        state.fixed.insert(IDN_QUERY.to_string(), MOCK_IDENTITY.to_string());
        state.fixed.insert(STB_QUERY.to_string(), "+0".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
            address: "MOCK0::INSTR".to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `query` with `reply` every time (after any one-shot replies).
    pub fn set_response(&self, query: &str, reply: &str) {
        self.state()
            .fixed
            .insert(query.to_string(), reply.to_string());
    }

    /// Answer the next `query` with `reply`, once.
    pub fn push_response(&self, query: &str, reply: &str) {
        self.state()
            .once
            .entry(query.to_string())
            .or_default()
            .push_back(Ok(reply.to_string()));
    }

    /// Fail the next `query` with `message`, once.
    pub fn push_failure(&self, query: &str, message: &str) {
        self.state()
            .once
            .entry(query.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    /// Fail every write of `command` with `message`.
    pub fn fail_write(&self, command: &str, message: &str) {
        self.state()
            .write_failures
            .insert(command.to_string(), message.to_string());
    }

    /// Every command and query received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Forget the recorded commands.
    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// True once `close` has been called on the current session.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Shared handle bound to `address`, with the closed flag cleared.
    fn reopen(&self, address: &str) -> Self {
        self.state().closed = false;
        Self {
            state: Arc::clone(&self.state),
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn write(&self, command: &str) -> Result<()> {
        let mut state = self.state();
        tracing::debug!(command, "Mock SCPI write");
        state.commands.push(command.to_string());
        match state.write_failures.get(command) {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut state = self.state();
        tracing::debug!(command, "Mock SCPI query");
        state.commands.push(command.to_string());

        if let Some(reply) = state.once.get_mut(command).and_then(VecDeque::pop_front) {
            return reply.map_err(|message| anyhow!("{}", message));
        }
        state
            .fixed
            .get(command)
            .cloned()
            .ok_or_else(|| anyhow!("No scripted response for query: {}", command))
    }

    async fn close(&self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Connector handing out clones of one [`MockTransport`].
pub struct MockConnector {
    transport: MockTransport,
    resources: Vec<String>,
    open_failures: AtomicUsize,
    opened: Mutex<Vec<String>>,
}

impl MockConnector {
    /// Connector for `transport` with no discoverable resources.
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            resources: Vec::new(),
            open_failures: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Resources returned by `list_resources`.
    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Fail the next `count` calls to `open`.
    pub fn with_open_failures(self, count: usize) -> Self {
        self.open_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Addresses passed to successful `open` calls.
    pub fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, address: &str, _timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
        let remaining = self.open_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.open_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("Failed to open resource: {}", address));
        }
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address.to_string());
        Ok(Box::new(self.transport.reopen(address)))
    }

    async fn list_resources(&self) -> Result<Vec<String>> {
        Ok(self.resources.clone())
    }
}
