// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Identifiers and small value types shared across the manager.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type DeviceId = u32;
pub type CuId = u32;
pub type ChannelId = u32;

/// Opaque identifier of one allocation (lease).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a reserved pool. Zero is the default pool.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PoolId(pub u64);

impl PoolId {
    pub const DEFAULT: PoolId = PoolId(0);

    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of compute unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CuType {
    #[default]
    IpKernel,
    SoftKernel,
}

/// Memory bank a CU is connected to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryBank {
    pub id: u32,
    #[serde(default)]
    pub kind: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub base_addr: u64,
}

/// Address of a compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CuRef {
    pub device_id: DeviceId,
    pub cu_id: CuId,
}

/// Address of one live channel on a compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub device_id: DeviceId,
    pub cu_id: CuId,
    pub channel_id: ChannelId,
}

impl ChannelRef {
    pub fn cu(&self) -> CuRef {
        CuRef { device_id: self.device_id, cu_id: self.cu_id }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device_id, self.cu_id, self.channel_id)
    }
}
