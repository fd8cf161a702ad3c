//! Modbus TCP transport with lazy (re)connection.
//!
//! The transport owns the only connection to the charger. Callers share it
//! through [`SharedTransport`], whose mutex serializes every transaction:
//! the device accepts a single session with one outstanding request.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::registers::REG_STATUS_BLOCK;

/// Transport shared between the poller and the write gate.
pub type SharedTransport<T> = Arc<Mutex<T>>;

/// Coarse failure classes reported for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// TCP session could not be established or was lost.
    Connection,
    /// Exception response or malformed PDU.
    Protocol,
    /// No response within the configured bound.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Connection => write!(f, "connection"),
            FailureKind::Protocol => write!(f, "protocol"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Device rejected request: {0}")]
    Exception(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Connection(_) => FailureKind::Connection,
            TransportError::Exception(_) | TransportError::Protocol(_) => FailureKind::Protocol,
            TransportError::Timeout(_) => FailureKind::Timeout,
        }
    }

    /// Whether the connection must be dropped after this error.
    ///
    /// An exception response is a complete, well-framed reply; anything else
    /// leaves the session in an unknown state.
    pub fn requires_reconnect(&self) -> bool {
        !matches!(self, TransportError::Exception(_))
    }
}

/// Access to the charger's holding registers.
///
/// Implementations perform exactly one transaction per call and report
/// every failure as a [`TransportError`]; they never panic on device-side
/// problems.
pub trait Transport: Send + 'static {
    /// Read `count` holding registers starting at `address` (function 0x03).
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    /// Write one holding register (function 0x06).
    fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Drop the current connection, if any. The next call reconnects.
    fn reset(&mut self);

    fn is_connected(&self) -> bool;
}

/// Read the device address register to check that the charger answers.
///
/// A successful probe says nothing about the rest of the register map.
pub async fn probe<T: Transport>(transport: &mut T) -> Result<u16, TransportError> {
    let words = transport
        .read_holding_registers(REG_STATUS_BLOCK, 1)
        .await?;
    words
        .first()
        .copied()
        .ok_or_else(|| TransportError::Protocol("empty probe response".to_string()))
}

/// Connection parameters for [`ModbusTcpTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Bound for each connection attempt and each transaction.
    pub timeout: Duration,
}

enum ConnectionState {
    Disconnected { last_error: Option<TransportError> },
    Connected(Context),
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected { last_error } => f
                .debug_struct("Disconnected")
                .field("last_error", last_error)
                .finish(),
            ConnectionState::Connected(_) => f.write_str("Connected"),
        }
    }
}

/// Modbus TCP client for one charger.
#[derive(Debug)]
pub struct ModbusTcpTransport {
    settings: TcpSettings,
    state: ConnectionState,
}

impl ModbusTcpTransport {
    /// Create a transport. No connection is made until first use.
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            settings,
            state: ConnectionState::Disconnected { last_error: None },
        }
    }

    pub fn settings(&self) -> &TcpSettings {
        &self.settings
    }

    /// Error that caused the last disconnect, if any.
    pub fn last_error(&self) -> Option<&TransportError> {
        match &self.state {
            ConnectionState::Disconnected { last_error } => last_error.as_ref(),
            ConnectionState::Connected(_) => None,
        }
    }

    /// Connect if not already connected.
    pub async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        match connect(&self.settings).await {
            Ok(ctx) => {
                info!(
                    host = %self.settings.host,
                    port = self.settings.port,
                    unit_id = self.settings.unit_id,
                    "Connected to charger"
                );
                self.state = ConnectionState::Connected(ctx);
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.settings.host, error = %e, "Failed to connect to charger");
                self.state = ConnectionState::Disconnected {
                    last_error: Some(e.clone()),
                };
                Err(e)
            }
        }
    }

    fn context(&mut self) -> Result<&mut Context, TransportError> {
        match &mut self.state {
            ConnectionState::Connected(ctx) => Ok(ctx),
            ConnectionState::Disconnected { .. } => {
                Err(TransportError::Connection("Not connected".to_string()))
            }
        }
    }

    /// Tear the connection down if the outcome left it unusable.
    fn settle<T>(&mut self, outcome: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &outcome {
            if e.requires_reconnect() {
                debug!(error = %e, "Dropping charger connection");
                self.state = ConnectionState::Disconnected {
                    last_error: Some(e.clone()),
                };
            }
        }
        outcome
    }
}

async fn connect(settings: &TcpSettings) -> Result<Context, TransportError> {
    let target = format!("{}:{}", settings.host, settings.port);
    let slave = Slave(settings.unit_id);

    let attempt = async {
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("No address found for {}", target)))?;

        tcp::connect_slave(addr, slave)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    };

    tokio::time::timeout(settings.timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout(settings.timeout))?
}

fn classify(err: tokio_modbus::Error) -> TransportError {
    if let tokio_modbus::Error::Protocol(_) = &err {
        return TransportError::Protocol(err.to_string());
    }
    TransportError::Connection(err.to_string())
}

impl Transport for ModbusTcpTransport {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.ensure_connected().await?;
        let timeout = self.settings.timeout;
        let ctx = self.context()?;

        trace!(address = format!("0x{:04X}", address), count, "Read holding registers");
        let outcome = match tokio::time::timeout(timeout, ctx.read_holding_registers(address, count))
            .await
        {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => Err(classify(e)),
            Ok(Ok(Err(code))) => Err(TransportError::Exception(format!("{:?}", code))),
            Ok(Ok(Ok(words))) if words.len() != usize::from(count) => {
                Err(TransportError::Protocol(format!(
                    "Expected {} registers, got {}",
                    count,
                    words.len()
                )))
            }
            Ok(Ok(Ok(words))) => Ok(words),
        };

        self.settle(outcome)
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        let timeout = self.settings.timeout;
        let ctx = self.context()?;

        trace!(address = format!("0x{:04X}", address), value, "Write single register");
        let outcome =
            match tokio::time::timeout(timeout, ctx.write_single_register(address, value)).await {
                Err(_) => Err(TransportError::Timeout(timeout)),
                Ok(Err(e)) => Err(classify(e)),
                Ok(Ok(Err(code))) => Err(TransportError::Exception(format!("{:?}", code))),
                Ok(Ok(Ok(()))) => Ok(()),
            };

        self.settle(outcome)
    }

    fn reset(&mut self) {
        if self.is_connected() {
            debug!(host = %self.settings.host, "Resetting charger connection");
        }
        self.state = ConnectionState::Disconnected { last_error: None };
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }
}
