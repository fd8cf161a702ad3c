//! Modbus TCP polling, decoding and control core for Fox ESS EV chargers.
//!
//! A [`Charger`] owns one lazily established Modbus TCP connection. A
//! background poll loop reads the device's register blocks on a fixed
//! interval and publishes each result as an immutable [`Snapshot`] of raw
//! register values. Writes go through a validating gate that shares the
//! connection with the poller and triggers an extra cycle once the device
//! acknowledges them.
//!
//! # Register blocks
//!
//! ```text
//! 0x1000  22 words  status, electrical values and limits
//! 0x1016   2 words  current session energy (u32)
//! 0x1018   2 words  total energy (u32)
//! 0x101A   2 words  fault code (u32)
//! 0x101C   2 words  RFID card (u32)
//! 0x3000  12 words  configuration
//! ```
//!
//! Scaled quantities and labels are computed from a snapshot by [`view`].
//!
//! [`Snapshot`]: foxess_charger_common::Snapshot

pub mod charger;
pub mod config;
pub mod decoder;
pub mod gate;
pub mod poller;
pub mod registers;
pub mod transport;
pub mod view;

pub use charger::Charger;
pub use config::{ChargerConfig, ConfigError, DeviceConfig};
pub use gate::{ValidationError, WriteError};
pub use poller::{CycleOutcome, CycleReport, PollState, PollerSettings};
pub use registers::RegisterMap;
pub use transport::{FailureKind, ModbusTcpTransport, TcpSettings, Transport, TransportError};
