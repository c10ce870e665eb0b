// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Placement constraint codec.
//!
//! V2 requests pack device, memory and policy hints into 64-bit fields.
//! They are decoded once at the request boundary; everything past that
//! point works with the tagged variants below.

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const TYPE_SHIFT: u32 = 32;
const TYPE_MASK: u64 = 0xFF;
const INDEXED_RESERVED_SHIFT: u32 = 40;
const POLICY_MASK: u64 = 0xFF;
const POLICY_RESERVED_SHIFT: u32 = 8;

const DEVICE_NONE: u64 = 0x0;
const DEVICE_HARDWARE: u64 = 0x1;
const DEVICE_VIRTUAL: u64 = 0x2;

const MEMORY_NONE: u64 = 0x0;
const MEMORY_HARDWARE: u64 = 0x1;

/// Which device a CU must come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceConstraint {
    #[default]
    None,
    /// A specific physical device id.
    HardwareIndex(u32),
    /// List members sharing a virtual index land on the same device.
    VirtualIndex(u32),
}

impl DeviceConstraint {
    pub fn decode(raw: u64) -> Result<Self, ResourceError> {
        if raw >> INDEXED_RESERVED_SHIFT != 0 {
            return Err(ResourceError::InvalidConstraint(format!(
                "device info {:#x} has reserved bits set",
                raw
            )));
        }
        let index = (raw & INDEX_MASK) as u32;
        match (raw >> TYPE_SHIFT) & TYPE_MASK {
            DEVICE_NONE => Ok(Self::None),
            DEVICE_HARDWARE => Ok(Self::HardwareIndex(index)),
            DEVICE_VIRTUAL => Ok(Self::VirtualIndex(index)),
            other => Err(ResourceError::InvalidConstraint(format!(
                "unknown device constraint type {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> u64 {
        match *self {
            Self::None => 0,
            Self::HardwareIndex(i) => (DEVICE_HARDWARE << TYPE_SHIFT) | u64::from(i),
            Self::VirtualIndex(i) => (DEVICE_VIRTUAL << TYPE_SHIFT) | u64::from(i),
        }
    }

    /// Physical device pinned by this constraint, if any.
    pub fn hardware_index(&self) -> Option<u32> {
        match *self {
            Self::HardwareIndex(i) => Some(i),
            _ => None,
        }
    }

    pub fn virtual_index(&self) -> Option<u32> {
        match *self {
            Self::VirtualIndex(i) => Some(i),
            _ => None,
        }
    }
}

/// Which memory bank a CU must be connected to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryConstraint {
    #[default]
    None,
    HardwareBank(u32),
}

impl MemoryConstraint {
    pub fn decode(raw: u64) -> Result<Self, ResourceError> {
        if raw >> INDEXED_RESERVED_SHIFT != 0 {
            return Err(ResourceError::InvalidConstraint(format!(
                "memory info {:#x} has reserved bits set",
                raw
            )));
        }
        match (raw >> TYPE_SHIFT) & TYPE_MASK {
            MEMORY_NONE => Ok(Self::None),
            MEMORY_HARDWARE => Ok(Self::HardwareBank((raw & INDEX_MASK) as u32)),
            other => Err(ResourceError::InvalidConstraint(format!(
                "unknown memory constraint type {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> u64 {
        match *self {
            Self::None => 0,
            Self::HardwareBank(b) => (MEMORY_HARDWARE << TYPE_SHIFT) | u64::from(b),
        }
    }

    pub fn bank(&self) -> Option<u32> {
        match *self {
            Self::HardwareBank(b) => Some(b),
            Self::None => None,
        }
    }
}

/// Tie-break order applied to candidate CUs of a single-CU request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    #[default]
    None,
    CuMostUsedFirst,
    CuLeastUsedFirst,
    DevMostUsedFirst,
    DevLeastUsedFirst,
}

impl Policy {
    pub fn decode(raw: u64) -> Result<Self, ResourceError> {
        if raw >> POLICY_RESERVED_SHIFT != 0 {
            return Err(ResourceError::InvalidConstraint(format!(
                "policy info {:#x} has reserved bits set",
                raw
            )));
        }
        match raw & POLICY_MASK {
            0x0 => Ok(Self::None),
            0x1 => Ok(Self::CuMostUsedFirst),
            0x2 => Ok(Self::CuLeastUsedFirst),
            0x3 => Ok(Self::DevMostUsedFirst),
            0x4 => Ok(Self::DevLeastUsedFirst),
            other => Err(ResourceError::InvalidConstraint(format!(
                "unknown policy type {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> u64 {
        match self {
            Self::None => 0x0,
            Self::CuMostUsedFirst => 0x1,
            Self::CuLeastUsedFirst => 0x2,
            Self::DevMostUsedFirst => 0x3,
            Self::DevLeastUsedFirst => 0x4,
        }
    }
}

/// The three decoded hint fields of one V2 request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub device: DeviceConstraint,
    pub memory: MemoryConstraint,
    pub policy: Policy,
}

impl Constraints {
    pub fn decode(device_info: u64, memory_info: u64, policy_info: u64) -> Result<Self, ResourceError> {
        Ok(Self {
            device: DeviceConstraint::decode(device_info)?,
            memory: MemoryConstraint::decode(memory_info)?,
            policy: Policy::decode(policy_info)?,
        })
    }

    /// Policies only apply to single-CU requests; list, group and pool
    /// requests silently drop them.
    pub fn without_policy(self) -> Self {
        Self { policy: Policy::None, ..self }
    }
}
