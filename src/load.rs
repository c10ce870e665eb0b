// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Fixed-point load encoding.
//!
//! A load travels as a signed 32-bit value carrying exactly one of two
//! scales:
//!
//! | bits    | meaning                              |
//! |---------|--------------------------------------|
//! | 31 - 28 | reserved, must be zero               |
//! | 27 -  8 | fine granularity (0 - 1,000,000)     |
//! |  7 -  0 | percent granularity (0 - 100)        |
//!
//! Internally every load is normalized to the fine scale so arithmetic
//! never mixes the two.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

pub const PERCENT_SCALE: u32 = 100;
pub const FINE_SCALE: u32 = 1_000_000;

const PERCENT_MASK: i32 = 0xFF;
const FINE_SHIFT: u32 = 8;
const FINE_MASK: i32 = 0xF_FFFF;
const RESERVED_MASK: i32 = 0x7000_0000;
const UNITS_PER_PERCENT: u32 = FINE_SCALE / PERCENT_SCALE;

/// Which scale a caller used when encoding a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[default]
    Percent,
    Fine,
}

/// A load normalized to fine-scale units (0 - 1,000,000).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Load(u32);

impl Load {
    pub const ZERO: Load = Load(0);
    pub const FULL: Load = Load(FINE_SCALE);

    /// Build a load from fine-scale units.
    pub fn from_units(units: u32) -> Result<Self, ResourceError> {
        if units > FINE_SCALE {
            return Err(ResourceError::InvalidLoadEncoding(
                ((units as i32) & FINE_MASK) << FINE_SHIFT,
            ));
        }
        Ok(Self(units))
    }

    /// Build a load from a whole percentage.
    pub fn from_percent(percent: u32) -> Result<Self, ResourceError> {
        if percent > PERCENT_SCALE {
            return Err(ResourceError::InvalidLoadEncoding(percent as i32));
        }
        Ok(Self(percent * UNITS_PER_PERCENT))
    }

    /// Fine-scale units.
    pub const fn units(self) -> u32 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Decode a packed load, remembering the scale the caller used.
    pub fn decode(raw: i32) -> Result<(Self, Granularity), ResourceError> {
        if raw < 0 || raw & RESERVED_MASK != 0 {
            return Err(ResourceError::InvalidLoadEncoding(raw));
        }
        let percent = (raw & PERCENT_MASK) as u32;
        let fine = ((raw >> FINE_SHIFT) & FINE_MASK) as u32;

        match (percent, fine) {
            (0, 0) => Ok((Self::ZERO, Granularity::Percent)),
            (p, 0) if p <= PERCENT_SCALE => Ok((Self(p * UNITS_PER_PERCENT), Granularity::Percent)),
            (0, f) if f <= FINE_SCALE => Ok((Self(f), Granularity::Fine)),
            _ => Err(ResourceError::InvalidLoadEncoding(raw)),
        }
    }

    /// Decode and discard the scale.
    pub fn normalize(raw: i32) -> Result<Self, ResourceError> {
        Self::decode(raw).map(|(load, _)| load)
    }

    /// Encode for the given scale. A percent load that is not a whole
    /// percentage is emitted on the fine scale instead of being rounded.
    pub fn encode(self, granularity: Granularity) -> i32 {
        match granularity {
            Granularity::Percent if self.0 % UNITS_PER_PERCENT == 0 => {
                (self.0 / UNITS_PER_PERCENT) as i32
            }
            _ => (self.0 as i32) << FINE_SHIFT,
        }
    }

    /// Sum of two loads, `None` past full scale.
    pub fn checked_add(self, rhs: Load) -> Option<Load> {
        let sum = self.0.checked_add(rhs.0)?;
        (sum <= FINE_SCALE).then_some(Load(sum))
    }

    pub fn saturating_sub(self, rhs: Load) -> Load {
        Load(self.0.saturating_sub(rhs.0))
    }

    /// Whether `requested` more load fits on top of `used` within `capacity`.
    pub fn fits(capacity: Load, used: Load, requested: Load) -> bool {
        u64::from(used.0) + u64::from(requested.0) <= u64::from(capacity.0)
    }
}

impl fmt::Display for Load {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNITS_PER_PERCENT;
        let frac = self.0 % UNITS_PER_PERCENT;
        if frac == 0 {
            write!(f, "{}%", whole)
        } else {
            write!(f, "{}.{:04}%", whole, frac)
        }
    }
}
