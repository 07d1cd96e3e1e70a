//! Real-time indication decoding.
//!
//! Layout of the characteristic value (little endian):
//!
//! | Bytes  | Field                                   |
//! |--------|-----------------------------------------|
//! | 0..4   | target temperature, raw `u32`           |
//! | 4..6   | room temperature, `i16` tenths of °C    |
//! | 6..8   | floor temperature, `i16` tenths of °C   |
//! | 13     | relay state, non-zero when active       |
//!
//! Some firmware sends a shorter value without the relay byte; the relay then
//! reads as off.
//!
//! The target temperature is not a plain fixed-point value; it goes through a
//! [`CalibrationCurve`] that is configured rather than hard-coded, since the
//! mapping was derived by measuring a handful of setpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Reading;

/// Shortest payload that carries the three temperatures.
pub const REALTIME_MIN_LEN: usize = 8;

/// Length of a full payload, relay byte included.
pub const REALTIME_FULL_LEN: usize = 14;

const RELAY_OFFSET: usize = 13;

/// Decoding failures. The reading is dropped; the session continues.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes than the layout needs.
    #[error("Real-time payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Required length.
        expected: usize,
        /// Received length.
        actual: usize,
    },

    /// The calibrated value is not a usable temperature.
    #[error("Calibrated {field} is out of range: {value}")]
    OutOfRange {
        /// Which field.
        field: &'static str,
        /// The offending value.
        value: f64,
    },
}

/// Maps the raw target register to degrees Celsius.
pub trait CalibrationCurve: Send + Sync {
    /// Convert a raw value to °C (unrounded).
    fn to_celsius(&self, raw: u32) -> f64;

    /// Inverse mapping, used to synthesize payloads.
    fn to_raw(&self, celsius: f64) -> u32;
}

/// A measured calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Raw register value.
    pub raw: u32,
    /// Temperature shown on the thermostat for that value.
    pub celsius: f64,
}

/// Configurable target temperature calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetCalibration {
    /// Two-point linear interpolation.
    Linear {
        /// Raw value at `temp_min`.
        raw_min: u32,
        /// Raw value at `temp_max`.
        raw_max: u32,
        /// Lowest setpoint in °C.
        temp_min: f64,
        /// Highest setpoint in °C.
        temp_max: f64,
    },
    /// `raw / divisor + offset`.
    Scaled {
        /// Divisor applied to the raw value.
        divisor: f64,
        /// Offset added afterwards, in °C.
        offset: f64,
    },
    /// Piecewise-linear through measured points, sorted by `raw`.
    Table {
        /// At least two points with strictly increasing `raw`.
        points: Vec<CalibrationPoint>,
    },
}

impl Default for TargetCalibration {
    /// Two points measured on an ECO16: 13038 shows 5 °C, 128198 shows 35 °C.
    fn default() -> Self {
        Self::Linear {
            raw_min: 13_038,
            raw_max: 128_198,
            temp_min: 5.0,
            temp_max: 35.0,
        }
    }
}

impl TargetCalibration {
    /// Check the curve is usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Linear {
                raw_min,
                raw_max,
                temp_min,
                temp_max,
            } => {
                if raw_min >= raw_max {
                    return Err("raw_min must be below raw_max".into());
                }
                if !(temp_min.is_finite() && temp_max.is_finite()) || temp_min >= temp_max {
                    return Err("temp_min must be below temp_max".into());
                }
            }
            Self::Scaled { divisor, offset } => {
                if !divisor.is_finite() || *divisor == 0.0 || !offset.is_finite() {
                    return Err("divisor must be finite and non-zero".into());
                }
            }
            Self::Table { points } => {
                if points.len() < 2 {
                    return Err("table needs at least two points".into());
                }
                if points.windows(2).any(|w| w[0].raw >= w[1].raw) {
                    return Err("table points must have strictly increasing raw values".into());
                }
                if points.iter().any(|p| !p.celsius.is_finite()) {
                    return Err("table temperatures must be finite".into());
                }
            }
        }
        Ok(())
    }
}

fn interpolate(x: f64, x0: f64, x1: f64, y0: f64, y1: f64) -> f64 {
    y0 + (x - x0) * ((y1 - y0) / (x1 - x0))
}

fn segment(points: &[CalibrationPoint], key: impl Fn(&CalibrationPoint) -> f64, x: f64) -> usize {
    points
        .windows(2)
        .position(|w| x <= key(&w[1]))
        .unwrap_or(points.len() - 2)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
impl CalibrationCurve for TargetCalibration {
    fn to_celsius(&self, raw: u32) -> f64 {
        let x = f64::from(raw);
        match self {
            Self::Linear {
                raw_min,
                raw_max,
                temp_min,
                temp_max,
            } => interpolate(x, f64::from(*raw_min), f64::from(*raw_max), *temp_min, *temp_max),
            Self::Scaled { divisor, offset } => x / divisor + offset,
            Self::Table { points } if points.len() < 2 => f64::NAN,
            Self::Table { points } => {
                let i = segment(points, |p| f64::from(p.raw), x);
                let (a, b) = (points[i], points[i + 1]);
                interpolate(x, f64::from(a.raw), f64::from(b.raw), a.celsius, b.celsius)
            }
        }
    }

    fn to_raw(&self, celsius: f64) -> u32 {
        let raw = match self {
            Self::Linear {
                raw_min,
                raw_max,
                temp_min,
                temp_max,
            } => interpolate(celsius, *temp_min, *temp_max, f64::from(*raw_min), f64::from(*raw_max)),
            Self::Scaled { divisor, offset } => (celsius - offset) * divisor,
            Self::Table { points } if points.len() < 2 => 0.0,
            Self::Table { points } => {
                let i = segment(points, |p| p.celsius, celsius);
                let (a, b) = (points[i], points[i + 1]);
                interpolate(celsius, a.celsius, b.celsius, f64::from(a.raw), f64::from(b.raw))
            }
        };
        raw.round().clamp(0.0, f64::from(u32::MAX)) as u32
    }
}

/// Round to one decimal place.
#[must_use]
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Decode a real-time indication payload.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for truncated payloads and
/// [`DecodeError::OutOfRange`] when the calibration yields a non-finite value.
pub fn decode_realtime(
    data: &[u8],
    calibration: &dyn CalibrationCurve,
    timestamp: DateTime<Utc>,
) -> Result<Reading, DecodeError> {
    if data.len() < REALTIME_MIN_LEN {
        return Err(DecodeError::TooShort {
            expected: REALTIME_MIN_LEN,
            actual: data.len(),
        });
    }

    let raw_target = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let room = i16::from_le_bytes([data[4], data[5]]);
    let floor = i16::from_le_bytes([data[6], data[7]]);

    let target = calibration.to_celsius(raw_target);
    if !target.is_finite() {
        return Err(DecodeError::OutOfRange {
            field: "target_temperature",
            value: target,
        });
    }

    Ok(Reading {
        target_temperature: round_tenth(target),
        room_temperature: f64::from(room) / 10.0,
        floor_temperature: f64::from(floor) / 10.0,
        relay_active: data.get(RELAY_OFFSET).is_some_and(|&relay| relay != 0),
        timestamp,
    })
}

/// Build a real-time payload from physical values.
///
/// Bytes not covered by the layout are zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_realtime(
    target: f64,
    room: f64,
    floor: f64,
    relay_active: bool,
    calibration: &dyn CalibrationCurve,
) -> Vec<u8> {
    let mut data = vec![0u8; REALTIME_FULL_LEN];
    data[0..4].copy_from_slice(&calibration.to_raw(target).to_le_bytes());
    data[4..6].copy_from_slice(&((room * 10.0).round() as i16).to_le_bytes());
    data[6..8].copy_from_slice(&((floor * 10.0).round() as i16).to_le_bytes());
    data[RELAY_OFFSET] = u8::from(relay_active);
    data
}
