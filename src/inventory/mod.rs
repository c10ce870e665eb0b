// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Authoritative in-memory catalog of devices, compute units and channels.
//!
//! The inventory knows nothing about leases, pools or groups beyond the
//! back-references stored on channels and CU claims. Callers hold the
//! manager lock for every mutation.

mod device;
mod image;

pub use device::{Channel, ComputeUnit, Device, LoadedImage};
pub use image::{
    CuDescriptor, ImageCatalog, ImageManifest, ImageProgrammer, ManifestProgrammer,
    StaticProgrammer,
};

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constraint::Policy;
use crate::error::{ResourceError, ResourceResult};
use crate::load::{Granularity, Load};
use crate::types::{ChannelRef, ClientId, CuId, CuRef, CuType, DeviceId, MemoryBank, PoolId, ServiceId};

/// How a request names the CUs it wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by")]
pub enum CuMatcher {
    /// Kernel name and/or alias. An empty field matches anything, but at
    /// least one must be set.
    Kernel { name: String, alias: String },
    /// Unique `kernelName:instanceName`.
    CuName { name: String },
}

impl CuMatcher {
    pub fn kernel(name: &str) -> Self {
        Self::Kernel { name: name.to_string(), alias: String::new() }
    }

    pub fn alias(alias: &str) -> Self {
        Self::Kernel { name: String::new(), alias: alias.to_string() }
    }

    pub fn cu_name(name: &str) -> Self {
        Self::CuName { name: name.to_string() }
    }

    pub fn matches(&self, cu: &ComputeUnit) -> bool {
        match self {
            Self::Kernel { name, alias } => {
                (name.is_empty() || *name == cu.kernel_name)
                    && (alias.is_empty() || *alias == cu.kernel_alias)
            }
            Self::CuName { name } => {
                let (kernel, instance) = match name.split_once(':') {
                    Some(parts) => parts,
                    None => return false,
                };
                kernel == cu.kernel_name && instance == cu.instance_name
            }
        }
    }

    pub fn validate(&self, max_name_len: usize) -> ResourceResult<()> {
        match self {
            Self::Kernel { name, alias } => {
                if name.is_empty() && alias.is_empty() {
                    return Err(ResourceError::InvalidArgument(
                        "kernel name and alias are both empty".into(),
                    ));
                }
                if name.len() > max_name_len || alias.len() > max_name_len {
                    return Err(ResourceError::InvalidArgument("kernel name too long".into()));
                }
            }
            Self::CuName { name } => {
                if !name.contains(':') {
                    return Err(ResourceError::InvalidArgument(format!(
                        "cu name {:?} is not kernelName:instanceName",
                        name
                    )));
                }
                if name.len() > max_name_len {
                    return Err(ResourceError::InvalidArgument("cu name too long".into()));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for CuMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel { name, alias } if alias.is_empty() => write!(f, "kernel {}", name),
            Self::Kernel { name, alias } if name.is_empty() => write!(f, "alias {}", alias),
            Self::Kernel { name, alias } => write!(f, "kernel {} ({})", name, alias),
            Self::CuName { name } => write!(f, "cu {}", name),
        }
    }
}

/// Which CUs are visible to a search relative to pool claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Leasing: CUs carved into exactly this pool (unclaimed ones for the
    /// default pool).
    Lease(PoolId),
    /// Reserving: unclaimed CUs without live channels.
    Claim,
}

impl Scope {
    fn admits(&self, cu: &ComputeUnit) -> bool {
        match *self {
            Scope::Lease(pool) if pool.is_default() => cu.claimed_by.is_none(),
            Scope::Lease(pool) => cu.claimed_by == Some(pool),
            Scope::Claim => cu.claimed_by.is_none() && cu.is_idle(),
        }
    }
}

/// Device and memory restrictions applied while collecting candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateFilter {
    pub device: Option<DeviceId>,
    pub memory_bank: Option<u32>,
    /// Empty means every device.
    pub allowed_devices: Vec<DeviceId>,
}

impl CandidateFilter {
    pub(crate) fn admits_device(&self, id: DeviceId) -> bool {
        self.device.map_or(true, |d| d == id)
            && (self.allowed_devices.is_empty() || self.allowed_devices.contains(&id))
    }
}

/// Everything needed to open a channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub load: Load,
    pub granularity: Granularity,
    pub exclusive: bool,
    pub service_id: ServiceId,
    pub client_id: ClientId,
    pub pool_id: PoolId,
}

/// CU identity as reported to clients, read from the inventory on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuInfo {
    pub device_id: DeviceId,
    pub cu_id: CuId,
    pub cu_name: String,
    pub kernel_name: String,
    pub kernel_alias: String,
    pub instance_name: String,
    pub cu_type: CuType,
    pub base_addr: u64,
    pub mem_bank: MemoryBank,
    pub image_path: PathBuf,
    pub uuid: Uuid,
    pub plugin_file_name: String,
    pub max_capacity: Load,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    devices: BTreeMap<DeviceId, Device>,
    max_devices: u32,
    max_channels_per_cu: usize,
}

impl Inventory {
    pub fn new(max_devices: u32, max_channels_per_cu: usize) -> Self {
        Self { devices: BTreeMap::new(), max_devices, max_channels_per_cu }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, id: DeviceId) -> ResourceResult<&Device> {
        self.devices.get(&id).ok_or(ResourceError::DeviceNotFound(id))
    }

    fn device_mut(&mut self, id: DeviceId) -> ResourceResult<&mut Device> {
        self.devices.get_mut(&id).ok_or(ResourceError::DeviceNotFound(id))
    }

    pub fn cu(&self, cu: CuRef) -> ResourceResult<&ComputeUnit> {
        self.device(cu.device_id)?.cu(cu.cu_id).ok_or_else(|| {
            ResourceError::NotFound(format!("cu {} on device {}", cu.cu_id, cu.device_id))
        })
    }

    fn cu_mut(&mut self, cu: CuRef) -> ResourceResult<&mut ComputeUnit> {
        self.device_mut(cu.device_id)?
            .cus
            .get_mut(cu.cu_id as usize)
            .ok_or_else(|| {
                ResourceError::NotFound(format!("cu {} on device {}", cu.cu_id, cu.device_id))
            })
    }

    pub fn cu_info(&self, cu: CuRef) -> ResourceResult<CuInfo> {
        let device = self.device(cu.device_id)?;
        let unit = self.cu(cu)?;
        let (image_path, uuid) = device
            .image
            .as_ref()
            .map(|img| (img.path.clone(), img.uuid))
            .unwrap_or_default();
        Ok(CuInfo {
            device_id: cu.device_id,
            cu_id: cu.cu_id,
            cu_name: unit.cu_name(),
            kernel_name: unit.kernel_name.clone(),
            kernel_alias: unit.kernel_alias.clone(),
            instance_name: unit.instance_name.clone(),
            cu_type: unit.cu_type,
            base_addr: unit.base_addr,
            mem_bank: unit.mem_bank,
            image_path,
            uuid,
            plugin_file_name: unit.plugin_file_name.clone(),
            max_capacity: unit.max_capacity,
        })
    }

    pub fn channel(&self, ch: ChannelRef) -> Option<&Channel> {
        self.cu(ch.cu()).ok()?.channel(ch.channel_id)
    }

    // -- Device administration ------------------------------------------------

    /// Enable a device slot, creating it on first use.
    pub fn enable_device(&mut self, id: DeviceId) -> ResourceResult<()> {
        if id >= self.max_devices {
            return Err(ResourceError::DeviceNotFound(id));
        }
        self.devices.entry(id).or_insert_with(|| Device::new(id)).enabled = true;
        Ok(())
    }

    /// Disable a device and drop its CU catalog. Refused while anything
    /// lives on it.
    pub fn disable_device(&mut self, id: DeviceId) -> ResourceResult<()> {
        let device = self.device_mut(id)?;
        if device.is_busy() {
            return Err(ResourceError::DeviceBusy(id));
        }
        device.enabled = false;
        device.image = None;
        device.cus.clear();
        device.exclusive_holder = None;
        Ok(())
    }

    /// Mark a device as being programmed. Until [`Inventory::install_image`]
    /// or [`Inventory::abort_programming`] runs, the device is neither
    /// searched, leased, claimed, disabled nor picked for another load.
    pub fn begin_programming(&mut self, id: DeviceId) -> ResourceResult<()> {
        let device = self.device_mut(id)?;
        if !device.enabled {
            return Err(ResourceError::DeviceNotReady(id));
        }
        if device.is_busy() {
            return Err(ResourceError::DeviceBusy(id));
        }
        device.programming = true;
        Ok(())
    }

    pub fn abort_programming(&mut self, id: DeviceId) {
        if let Ok(device) = self.device_mut(id) {
            device.programming = false;
        }
    }

    /// Replace a device's CU catalog with a freshly programmed image and
    /// clear its programming mark.
    pub fn install_image(&mut self, id: DeviceId, catalog: &ImageCatalog) -> ResourceResult<()> {
        catalog.validate()?;
        let device = self.device_mut(id)?;
        if !device.enabled {
            return Err(ResourceError::DeviceNotReady(id));
        }
        if device.has_live_channels() || device.has_claims() {
            return Err(ResourceError::DeviceBusy(id));
        }
        device.cus = catalog
            .compute_units
            .iter()
            .enumerate()
            .map(|(idx, desc)| ComputeUnit::from_descriptor(idx as CuId, desc))
            .collect();
        device.image = Some(LoadedImage { uuid: catalog.uuid, path: catalog.path.clone() });
        device.exclusive_holder = None;
        device.programming = false;
        Ok(())
    }

    pub fn unload_image(&mut self, id: DeviceId) -> ResourceResult<()> {
        let device = self.device_mut(id)?;
        if device.image.is_none() {
            return Err(ResourceError::DeviceNotReady(id));
        }
        if device.is_busy() {
            return Err(ResourceError::DeviceBusy(id));
        }
        device.image = None;
        device.cus.clear();
        Ok(())
    }

    /// An enabled device that can be reprogrammed right now. Unloaded
    /// devices are preferred over idle loaded ones.
    pub fn idle_device_for_load(&self) -> Option<DeviceId> {
        let idle = |d: &&Device| d.enabled && !d.is_busy();
        self.devices
            .values()
            .filter(idle)
            .find(|d| d.image.is_none())
            .or_else(|| self.devices.values().find(idle))
            .map(|d| d.id)
    }

    // -- Candidate search ------------------------------------------------------

    /// Matching CUs in device-id then CU-id order. Only ready devices are
    /// searched.
    pub fn find_candidates(
        &self,
        matcher: &CuMatcher,
        filter: &CandidateFilter,
        scope: Scope,
    ) -> Vec<CuRef> {
        self.devices
            .values()
            .filter(|d| d.is_ready() && filter.admits_device(d.id))
            .flat_map(move |d| {
                d.cus
                    .iter()
                    .filter(move |cu| matcher.matches(cu))
                    .filter(move |cu| filter.memory_bank.map_or(true, |b| cu.mem_bank.id == b))
                    .filter(move |cu| scope.admits(cu))
                    .map(move |cu| CuRef { device_id: d.id, cu_id: cu.id })
            })
            .collect()
    }

    /// Ready devices passing `filter`, in id order.
    pub(crate) fn ready_devices(&self, filter: &CandidateFilter) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| d.is_ready() && filter.admits_device(d.id))
            .map(|d| d.id)
            .collect()
    }

    /// Stable reorder of candidates by CU or device utilization.
    pub fn order_by_policy(&self, candidates: &mut [CuRef], policy: Policy) {
        let cu_used = |c: &CuRef| -> u64 {
            self.cu(*c).map(|cu| u64::from(cu.used_load().units())).unwrap_or(0)
        };
        let dev_used = |c: &CuRef| -> u64 {
            self.device(c.device_id).map(|d| d.used_load_units()).unwrap_or(0)
        };
        match policy {
            Policy::None => {}
            Policy::CuLeastUsedFirst => candidates.sort_by_key(cu_used),
            Policy::CuMostUsedFirst => candidates.sort_by_key(|c| std::cmp::Reverse(cu_used(c))),
            Policy::DevLeastUsedFirst => candidates.sort_by_key(dev_used),
            Policy::DevMostUsedFirst => candidates.sort_by_key(|c| std::cmp::Reverse(dev_used(c))),
        }
    }

    // -- Load bookkeeping ------------------------------------------------------

    /// Open a channel on `cu` carrying `spec.load`.
    pub fn reserve_load(&mut self, cu: CuRef, spec: &ChannelSpec) -> ResourceResult<ChannelRef> {
        let max_channels = self.max_channels_per_cu;
        let device = self.device_mut(cu.device_id)?;
        if !device.is_ready() {
            return Err(ResourceError::DeviceNotReady(cu.device_id));
        }
        if device.exclusive_holder.map_or(false, |h| h != spec.service_id)
            || (spec.exclusive && device.hosts_other_than(spec.service_id))
        {
            return Err(ResourceError::ExclusivityConflict(cu.device_id));
        }

        let unit = device.cus.get_mut(cu.cu_id as usize).ok_or_else(|| {
            ResourceError::NotFound(format!("cu {} on device {}", cu.cu_id, cu.device_id))
        })?;
        if unit.channels.len() >= max_channels {
            return Err(ResourceError::CapacityExceeded {
                requested: spec.load.units(),
                available: 0,
            });
        }
        let used = unit.used_load();
        if !Load::fits(unit.max_capacity, used, spec.load) {
            return Err(ResourceError::CapacityExceeded {
                requested: spec.load.units(),
                available: unit.max_capacity.saturating_sub(used).units(),
            });
        }

        let channel_id = unit.next_channel_id();
        unit.channels.insert(
            channel_id,
            Channel {
                id: channel_id,
                load: spec.load,
                granularity: spec.granularity,
                service_id: spec.service_id,
                client_id: spec.client_id,
                pool_id: spec.pool_id,
            },
        );
        if spec.exclusive {
            device.exclusive_holder = Some(spec.service_id);
        }
        Ok(ChannelRef { device_id: cu.device_id, cu_id: cu.cu_id, channel_id })
    }

    /// Close a channel owned by `service_id`.
    pub fn release_load(&mut self, ch: ChannelRef, service_id: ServiceId) -> ResourceResult<Channel> {
        let device = self
            .device_mut(ch.device_id)
            .map_err(|_| ResourceError::StaleDescriptor(format!("channel {}", ch)))?;
        let unit = device
            .cus
            .get_mut(ch.cu_id as usize)
            .ok_or_else(|| ResourceError::StaleDescriptor(format!("channel {}", ch)))?;
        match unit.channels.get(&ch.channel_id) {
            Some(live) if live.service_id == service_id => {}
            _ => return Err(ResourceError::StaleDescriptor(format!("channel {}", ch))),
        }
        let removed = unit.channels.remove(&ch.channel_id);
        if device.exclusive_holder == Some(service_id) && !device.hosts(service_id) {
            device.exclusive_holder = None;
        }
        removed.ok_or_else(|| ResourceError::StaleDescriptor(format!("channel {}", ch)))
    }

    // -- Pool claims -----------------------------------------------------------

    /// Carve a whole CU into `pool`.
    pub fn claim(&mut self, cu: CuRef, pool: PoolId, load: Load) -> ResourceResult<()> {
        let unit = self.cu_mut(cu)?;
        if unit.claimed_by.is_some() || !unit.is_idle() {
            return Err(ResourceError::ExclusivityConflict(cu.device_id));
        }
        if load > unit.max_capacity {
            return Err(ResourceError::CapacityExceeded {
                requested: load.units(),
                available: unit.max_capacity.units(),
            });
        }
        unit.claimed_by = Some(pool);
        Ok(())
    }

    pub fn unclaim(&mut self, cu: CuRef, pool: PoolId) {
        if let Ok(unit) = self.cu_mut(cu) {
            if unit.claimed_by == Some(pool) {
                unit.claimed_by = None;
            }
        }
    }

    /// Whether every CU of the device can be carved into a pool at once.
    pub(crate) fn device_fully_claimable(&self, id: DeviceId) -> bool {
        self.device(id).map_or(false, |d| {
            d.is_ready() && !d.cus.is_empty() && d.cus.iter().all(|cu| Scope::Claim.admits(cu))
        })
    }

    // -- Utilization -----------------------------------------------------------

    /// Per-CU used load, in device then CU order.
    pub fn utilization(&self) -> Vec<(CuRef, Load)> {
        self.devices
            .values()
            .flat_map(|d| {
                d.cus
                    .iter()
                    .map(move |cu| (CuRef { device_id: d.id, cu_id: cu.id }, cu.used_load()))
            })
            .collect()
    }

    pub fn live_channel_count(&self) -> usize {
        self.devices
            .values()
            .flat_map(|d| d.cus.iter())
            .map(|cu| cu.channels.len())
            .sum()
    }
}

#[cfg(test)]
#[path = "inventory_tests.rs"]
mod tests;
