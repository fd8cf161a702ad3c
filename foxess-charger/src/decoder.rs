//! Pure decoding of raw register blocks.
//!
//! [`decode`] turns the words of one [`RegisterBlock`] into snapshot
//! entries holding the raw integers. The scale helpers below are the
//! arithmetic used by the derived view; they never fail on out-of-range
//! input.

use std::collections::BTreeMap;

use foxess_charger_common::Value;
use thiserror::Error;

use crate::registers::{FieldKind, RegisterBlock};

/// Raw port temperature reported when no sensor is fitted.
pub const TEMPERATURE_ABSENT: u16 = 0xFFFF;

/// Errors from decoding a malformed block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("block 0x{block:04X}: expected {expected} words, got {actual}")]
    Length {
        block: u16,
        expected: usize,
        actual: usize,
    },
    #[error("block 0x{block:04X}: field '{field}' extends past the block")]
    Field { block: u16, field: &'static str },
}

/// Decode the words read for `block` into field name -> raw value.
///
/// Reserved words are dropped. Enum and boolean fields keep their raw code
/// so that writes and derived labels can both be computed from the snapshot.
pub fn decode(block: &RegisterBlock, words: &[u16]) -> Result<BTreeMap<String, Value>, DecodeError> {
    if words.len() != usize::from(block.count) {
        return Err(DecodeError::Length {
            block: block.start,
            expected: usize::from(block.count),
            actual: words.len(),
        });
    }

    let mut fields = BTreeMap::new();
    for field in block.fields {
        let at = usize::from(field.offset);
        let word = |i: usize| {
            words.get(i).copied().ok_or(DecodeError::Field {
                block: block.start,
                field: field.name,
            })
        };
        let value = match field.kind {
            FieldKind::Skip => continue,
            FieldKind::RawU16 | FieldKind::Enum(_) | FieldKind::BoolEq(_) => {
                Value::from(word(at)?)
            }
            FieldKind::ComposedU32Be => Value::from(compose_u32(word(at)?, word(at + 1)?)),
        };
        fields.insert(field.name.to_string(), value);
    }

    Ok(fields)
}

/// Combine two big-endian words into a `u32`.
pub fn compose_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Split a `u32` into its (high, low) words.
pub fn split_u32(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, value as u16)
}

/// `raw × factor`.
pub fn scaled(raw: u32, factor: f64) -> f64 {
    f64::from(raw) * factor
}

/// Temperature in °C from a raw word (`raw × 0.1 − 50`).
pub fn temperature(raw: u16) -> f64 {
    f64::from(raw) * 0.1 - 50.0
}

/// Port temperature, `None` when the sensor is absent.
pub fn port_temperature(raw: u16) -> Option<f64> {
    (raw != TEMPERATURE_ABSENT).then(|| temperature(raw))
}

/// Firmware version "major.minor" from the high and low byte of one word.
pub fn firmware_version(raw: u16) -> String {
    format!("{}.{}", raw >> 8, raw & 0xFF)
}

/// Round to a fixed number of decimals.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
