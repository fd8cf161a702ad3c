//! Validated writes to the charger's control registers.
//!
//! Every write is checked against the register map before the device is
//! touched. Writes share the transport mutex with the poller; tokio's
//! mutex is fair, so concurrent writes are applied in arrival order behind
//! whatever transaction is in flight.

use tracing::{debug, info, warn};

use crate::poller::RefreshTrigger;
use crate::registers::{Control, RegisterMap, WritableRegister, code_for};
use crate::transport::{SharedTransport, Transport, TransportError};

/// A write request rejected before reaching the device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown register '{0}'")]
    UnknownRegister(String),
    #[error("Register 0x{0:04X} is not writable")]
    NotWritable(u16),
    #[error("{register}: value must be a finite number")]
    NotFinite { register: &'static str },
    #[error("{register}: {value} is outside {min}..={max}")]
    OutOfRange {
        register: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{register}: unknown option '{option}'")]
    UnknownOption {
        register: &'static str,
        option: String,
    },
    #[error("{register}: code {code} is not accepted")]
    InvalidCode { register: &'static str, code: u16 },
    #[error("{register} is not a {expected}")]
    WrongControl {
        register: &'static str,
        expected: &'static str,
    },
}

/// Error type for write operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Write to {register} failed: {source}")]
    Transport {
        register: &'static str,
        #[source]
        source: TransportError,
    },
}

impl WriteError {
    /// Whether the request reached the device.
    pub fn reached_device(&self) -> bool {
        matches!(self, WriteError::Transport { .. })
    }
}

/// Resolve a logical value to the raw word for `register`.
///
/// Bounds are checked on the logical value; the raw word is
/// `round(value × scale)`.
pub fn resolve(register: &'static WritableRegister, value: f64) -> Result<u16, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite {
            register: register.name,
        });
    }
    if value < register.min || value > register.max {
        return Err(ValidationError::OutOfRange {
            register: register.name,
            value,
            min: register.min,
            max: register.max,
        });
    }

    let raw = (value * register.scale).round() as u16;
    check_code(register, raw)?;
    Ok(raw)
}

/// Check a raw word against the register's bounds and accepted codes.
pub fn check_raw(register: &'static WritableRegister, raw: u16) -> Result<(), ValidationError> {
    let (min, max) = register.raw_bounds();
    if raw < min || raw > max {
        return Err(ValidationError::OutOfRange {
            register: register.name,
            value: f64::from(raw),
            min: f64::from(min),
            max: f64::from(max),
        });
    }
    check_code(register, raw)
}

fn check_code(register: &'static WritableRegister, raw: u16) -> Result<(), ValidationError> {
    let accepted = match register.control {
        Control::Select { options, .. } => options.iter().any(|(c, _)| *c == raw),
        Control::Switch { on, off, .. } => raw == on || raw == off,
        Control::Number { .. } | Control::Command => true,
    };
    if accepted {
        Ok(())
    } else {
        Err(ValidationError::InvalidCode {
            register: register.name,
            code: raw,
        })
    }
}

/// Serialized, validated access to the writable registers.
pub struct WriteGate<T: Transport> {
    transport: SharedTransport<T>,
    map: RegisterMap,
    refresh: RefreshTrigger,
}

impl<T: Transport> Clone for WriteGate<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            map: self.map,
            refresh: self.refresh.clone(),
        }
    }
}

impl<T: Transport> WriteGate<T> {
    pub fn new(transport: SharedTransport<T>, map: RegisterMap, refresh: RefreshTrigger) -> Self {
        Self {
            transport,
            map,
            refresh,
        }
    }

    fn register(&self, name: &str) -> Result<&'static WritableRegister, ValidationError> {
        self.map
            .writable_by_name(name)
            .ok_or_else(|| ValidationError::UnknownRegister(name.to_string()))
    }

    /// Write a logical value (e.g. 16.0 A) to the named register.
    ///
    /// Returns the raw word written.
    pub async fn write_value(&self, name: &str, value: f64) -> Result<u16, WriteError> {
        let register = self.register(name)?;
        let raw = resolve(register, value).inspect_err(|e| {
            debug!(register = name, error = %e, "Rejected write");
        })?;
        self.execute(register, raw).await?;
        Ok(raw)
    }

    /// Write a raw word to a register by address.
    pub async fn write_raw(&self, address: u16, raw: u16) -> Result<(), WriteError> {
        let register = self
            .map
            .writable_at(address)
            .ok_or(ValidationError::NotWritable(address))?;
        check_raw(register, raw).inspect_err(|e| {
            debug!(register = register.name, error = %e, "Rejected write");
        })?;
        self.execute(register, raw).await
    }

    /// Select an option of a select register by label.
    pub async fn select_option(&self, name: &str, option: &str) -> Result<u16, WriteError> {
        let register = self.register(name)?;
        let options = register.options().ok_or(ValidationError::WrongControl {
            register: register.name,
            expected: "select",
        })?;
        let code = code_for(options, option).ok_or_else(|| ValidationError::UnknownOption {
            register: register.name,
            option: option.to_string(),
        })?;
        self.execute(register, code).await?;
        Ok(code)
    }

    /// Turn a switch register on or off.
    pub async fn set_switch(&self, name: &str, on: bool) -> Result<u16, WriteError> {
        let register = self.register(name)?;
        let Control::Switch {
            on: on_code,
            off: off_code,
            ..
        } = register.control
        else {
            return Err(ValidationError::WrongControl {
                register: register.name,
                expected: "switch",
            }
            .into());
        };
        let code = if on { on_code } else { off_code };
        self.execute(register, code).await?;
        Ok(code)
    }

    async fn execute(&self, register: &'static WritableRegister, raw: u16) -> Result<(), WriteError> {
        let result = {
            let mut transport = self.transport.lock().await;
            transport.write_single_register(register.address, raw).await
        };

        match result {
            Ok(()) => {
                info!(
                    register = register.name,
                    address = format!("0x{:04X}", register.address),
                    raw,
                    "Register written"
                );
                self.refresh.request();
                Ok(())
            }
            Err(e) => {
                warn!(
                    register = register.name,
                    address = format!("0x{:04X}", register.address),
                    error = %e,
                    "Register write failed"
                );
                Err(WriteError::Transport {
                    register: register.name,
                    source: e,
                })
            }
        }
    }
}
