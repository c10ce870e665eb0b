// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Devices, compute units and channels.

use std::collections::BTreeMap;
use std::path::PathBuf;

use uuid::Uuid;

use super::image::CuDescriptor;
use crate::load::{Granularity, Load};
use crate::types::{ChannelId, ClientId, CuId, CuType, DeviceId, MemoryBank, PoolId, ServiceId};

/// One leased slice of a compute unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub load: Load,
    pub granularity: Granularity,
    pub service_id: ServiceId,
    pub client_id: ClientId,
    pub pool_id: PoolId,
}

/// A schedulable kernel instance on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeUnit {
    pub id: CuId,
    pub kernel_name: String,
    pub kernel_alias: String,
    pub instance_name: String,
    pub cu_type: CuType,
    pub base_addr: u64,
    pub mem_bank: MemoryBank,
    pub plugin_file_name: String,
    pub max_capacity: Load,
    pub(crate) channels: BTreeMap<ChannelId, Channel>,
    pub(crate) claimed_by: Option<PoolId>,
}

impl ComputeUnit {
    pub(crate) fn from_descriptor(id: CuId, desc: &CuDescriptor) -> Self {
        Self {
            id,
            kernel_name: desc.kernel_name.clone(),
            kernel_alias: desc.kernel_alias.clone(),
            instance_name: desc.instance_name.clone(),
            cu_type: desc.cu_type,
            base_addr: desc.base_addr,
            mem_bank: desc.mem_bank,
            plugin_file_name: desc.plugin_file_name.clone(),
            max_capacity: desc.capacity(),
            channels: BTreeMap::new(),
            claimed_by: None,
        }
    }

    /// Unique name: `kernelName:instanceName`.
    pub fn cu_name(&self) -> String {
        format!("{}:{}", self.kernel_name, self.instance_name)
    }

    /// Sum of live channel loads. Never exceeds `max_capacity`.
    pub fn used_load(&self) -> Load {
        self.channels
            .values()
            .fold(Load::ZERO, |acc, ch| acc.checked_add(ch.load).unwrap_or(Load::FULL))
    }

    pub fn free_load(&self) -> Load {
        self.max_capacity.saturating_sub(self.used_load())
    }

    pub fn is_idle(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Pool this CU is carved into, if any.
    pub fn claimed_by(&self) -> Option<PoolId> {
        self.claimed_by
    }

    /// Lowest channel id not used by a live channel.
    pub(crate) fn next_channel_id(&self) -> ChannelId {
        let mut candidate: ChannelId = 0;
        for id in self.channels.keys() {
            if *id != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }
}

/// Image currently programmed onto a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub uuid: Uuid,
    pub path: PathBuf,
}

/// One physical accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub enabled: bool,
    pub image: Option<LoadedImage>,
    pub(crate) cus: Vec<ComputeUnit>,
    pub(crate) exclusive_holder: Option<ServiceId>,
    /// Set while an image is being programmed outside the manager lock.
    pub(crate) programming: bool,
}

impl Device {
    pub(crate) fn new(id: DeviceId) -> Self {
        Self {
            id,
            enabled: false,
            image: None,
            cus: Vec::new(),
            exclusive_holder: None,
            programming: false,
        }
    }

    /// Enabled, programmed with an image, and not being reprogrammed.
    pub fn is_ready(&self) -> bool {
        self.enabled && self.image.is_some() && !self.programming
    }

    pub fn is_programming(&self) -> bool {
        self.programming
    }

    pub fn compute_units(&self) -> &[ComputeUnit] {
        &self.cus
    }

    pub fn cu(&self, id: CuId) -> Option<&ComputeUnit> {
        self.cus.get(id as usize)
    }

    pub fn exclusive_holder(&self) -> Option<ServiceId> {
        self.exclusive_holder
    }

    /// Total load leased across every CU of the device.
    pub fn used_load_units(&self) -> u64 {
        self.cus.iter().map(|cu| u64::from(cu.used_load().units())).sum()
    }

    pub fn has_live_channels(&self) -> bool {
        self.cus.iter().any(|cu| !cu.channels.is_empty())
    }

    pub fn has_claims(&self) -> bool {
        self.cus.iter().any(|cu| cu.claimed_by.is_some())
    }

    /// Leased, carved into a pool, or being programmed.
    pub(crate) fn is_busy(&self) -> bool {
        self.programming || self.has_live_channels() || self.has_claims()
    }

    /// Whether any live channel on this device belongs to another lease.
    pub(crate) fn hosts_other_than(&self, service_id: ServiceId) -> bool {
        self.cus
            .iter()
            .flat_map(|cu| cu.channels.values())
            .any(|ch| ch.service_id != service_id)
    }

    pub(crate) fn hosts(&self, service_id: ServiceId) -> bool {
        self.cus
            .iter()
            .flat_map(|cu| cu.channels.values())
            .any(|ch| ch.service_id == service_id)
    }

    pub(crate) fn image_uuid(&self) -> Option<Uuid> {
        self.image.as_ref().map(|img| img.uuid)
    }
}
