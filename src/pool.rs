// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Resource pools: sub-inventories reserved for leases that quote them.
//!
//! Reserving runs the same placement search as list allocation, but
//! against unclaimed idle CUs, and carves the matches out whole instead of
//! opening channels. Leases drawn from a pool still go through the normal
//! allocator with the pool's id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocator::placement::{place_list, rollback, ClaimPlacer, Placed};
use crate::allocator::CuListRequest;
use crate::error::{ResourceError, ResourceResult};
use crate::inventory::{CandidateFilter, CuInfo, CuMatcher, Inventory};
use crate::limits::ManagerLimits;
use crate::load::Load;
use crate::manager::ManagerState;
use crate::types::{ClientId, CuRef, DeviceId, PoolId};

/// What a pool should hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolRequest {
    /// One CU list, reserved `list_count` times.
    pub cu_list: Option<CuListRequest>,
    pub list_count: usize,
    /// Whole devices programmed with this image, `image_count` of them.
    pub image_uuid: Option<Uuid>,
    pub image_count: usize,
    /// Only these devices may contribute. Empty means any.
    pub allowed_devices: Vec<DeviceId>,
}

impl PoolRequest {
    pub fn lists(list: CuListRequest, count: usize) -> Self {
        Self { cu_list: Some(list), list_count: count, ..Default::default() }
    }

    pub fn images(uuid: Uuid, count: usize) -> Self {
        Self { image_uuid: Some(uuid), image_count: count, ..Default::default() }
    }

    pub fn on_devices(mut self, devices: Vec<DeviceId>) -> Self {
        self.allowed_devices = devices;
        self
    }

    pub fn validate(&self, limits: &ManagerLimits) -> ResourceResult<()> {
        let wants_lists = self.cu_list.is_some() && self.list_count > 0;
        let wants_images = self.image_uuid.is_some() && self.image_count > 0;
        if !wants_lists && !wants_images {
            return Err(ResourceError::InvalidArgument("pool request reserves nothing".into()));
        }
        if self.list_count > limits.max_pool_lists || self.image_count > limits.max_pool_lists {
            return Err(ResourceError::InvalidArgument(format!(
                "pool request exceeds {} copies",
                limits.max_pool_lists
            )));
        }
        if self.allowed_devices.len() > limits.max_devices as usize {
            return Err(ResourceError::InvalidArgument("device allow-list too long".into()));
        }
        if let Some(list) = &self.cu_list {
            list.validate(limits)?;
            if !list.pool_id().is_default() {
                return Err(ResourceError::InvalidArgument(
                    "pools are reserved from the default pool".into(),
                ));
            }
        }
        Ok(())
    }

    fn filter(&self) -> CandidateFilter {
        CandidateFilter { allowed_devices: self.allowed_devices.clone(), ..Default::default() }
    }
}

/// Where a reservation landed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReservationInfo {
    /// Device of every member, per reserved list copy.
    pub cu_lists: Vec<Vec<DeviceId>>,
    /// Device of every reserved image copy.
    pub images: Vec<DeviceId>,
    /// Every device the pool touches, ascending.
    pub devices: Vec<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePool {
    pub id: PoolId,
    pub owner: ClientId,
    pub cus: Vec<CuRef>,
    pub info: PoolReservationInfo,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PoolTable {
    pools: BTreeMap<PoolId, ResourcePool>,
    next_pool_id: u64,
}

impl Default for PoolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolTable {
    pub fn new() -> Self {
        Self { pools: BTreeMap::new(), next_pool_id: 1 }
    }

    fn next_pool_id(&mut self) -> PoolId {
        let id = PoolId(self.next_pool_id);
        self.next_pool_id += 1;
        id
    }

    pub fn contains(&self, pool_id: PoolId) -> bool {
        self.pools.contains_key(&pool_id)
    }

    pub fn get(&self, pool_id: PoolId) -> Option<&ResourcePool> {
        self.pools.get(&pool_id)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn owned_by(&self, client_id: ClientId) -> Vec<PoolId> {
        self.pools.values().filter(|p| p.owner == client_id).map(|p| p.id).collect()
    }
}

/// Carve everything `req` asks for into `pool_id`, or nothing.
fn carve(inv: &mut Inventory, pool_id: PoolId, req: &PoolRequest) -> ResourceResult<(Vec<CuRef>, PoolReservationInfo)> {
    let mut placer = ClaimPlacer { pool_id };
    let mut claimed: Vec<Placed<CuRef>> = Vec::new();
    let mut info = PoolReservationInfo::default();
    let filter = req.filter();

    if let Some(uuid) = req.image_uuid {
        for copy in 0..req.image_count {
            let device = inv
                .ready_devices(&filter)
                .into_iter()
                .find(|d| {
                    inv.device(*d).map_or(false, |dev| dev.image_uuid() == Some(uuid))
                        && inv.device_fully_claimable(*d)
                });
            let Some(device) = device else {
                rollback(inv, &mut placer, claimed);
                return Err(ResourceError::NotFound(format!(
                    "image {} copy {} has no idle device",
                    uuid, copy
                )));
            };
            let cus: Vec<CuRef> = inv
                .device(device)?
                .compute_units()
                .iter()
                .map(|cu| CuRef { device_id: device, cu_id: cu.id })
                .collect();
            for cu in cus {
                if let Err(e) = inv.claim(cu, pool_id, Load::ZERO) {
                    rollback(inv, &mut placer, claimed);
                    return Err(e);
                }
                claimed.push(Placed { member: 0, token: cu });
            }
            info.images.push(device);
        }
    }

    if let Some(list) = &req.cu_list {
        for copy in 0..req.list_count {
            match place_list(inv, &mut placer, list, &filter) {
                Ok(placed) => {
                    info.cu_lists.push(placed.iter().map(|p| p.token.device_id).collect());
                    claimed.extend(placed);
                }
                Err(e) => {
                    rollback(inv, &mut placer, claimed);
                    return Err(match e {
                        ResourceError::InvalidArgument(_) | ResourceError::InvalidConstraint(_) => e,
                        e => ResourceError::NotFound(format!("cu list copy {}: {}", copy, e)),
                    });
                }
            }
        }
    }

    let cus: Vec<CuRef> = claimed.into_iter().map(|p| p.token).collect();
    let mut devices: Vec<DeviceId> = cus.iter().map(|cu| cu.device_id).collect();
    devices.sort_unstable();
    devices.dedup();
    info.devices = devices;
    Ok((cus, info))
}

impl ManagerState {
    /// Reserve a new pool. The returned id is never zero.
    pub fn reserve_pool(
        &mut self,
        client_id: ClientId,
        req: &PoolRequest,
    ) -> ResourceResult<(PoolId, PoolReservationInfo)> {
        req.validate(&self.limits)?;
        let pool_id = self.pools.next_pool_id();
        let (cus, info) = carve(&mut self.inventory, pool_id, req)?;
        self.pools.pools.insert(
            pool_id,
            ResourcePool { id: pool_id, owner: client_id, cus, info: info.clone(), reserved_at: Utc::now() },
        );
        Ok((pool_id, info))
    }

    /// Return a pool's CUs to general availability. Refused while any lease
    /// still draws from it.
    pub fn relinquish_pool(&mut self, pool_id: PoolId) -> ResourceResult<()> {
        if !self.pools.contains(pool_id) {
            return Err(ResourceError::NotFound(format!("pool {}", pool_id)));
        }
        let leases = self.ledger.count_in_pool(pool_id);
        if leases > 0 {
            return Err(ResourceError::PoolInUse { pool_id: pool_id.0, leases });
        }
        if let Some(pool) = self.pools.pools.remove(&pool_id) {
            for cu in pool.cus {
                self.inventory.unclaim(cu, pool_id);
            }
        }
        Ok(())
    }

    /// CUs carved into a pool, optionally narrowed to one kernel. Channel,
    /// service id and load do not apply to pool entries.
    pub fn reservation_query(
        &self,
        pool_id: PoolId,
        filter: Option<&CuMatcher>,
    ) -> ResourceResult<Vec<CuInfo>> {
        let pool = self
            .pools
            .get(pool_id)
            .ok_or_else(|| ResourceError::NotFound(format!("pool {}", pool_id)))?;
        let mut infos = Vec::with_capacity(pool.cus.len());
        for cu in &pool.cus {
            let unit = self.inventory.cu(*cu)?;
            if filter.map_or(true, |m| m.matches(unit)) {
                infos.push(self.inventory.cu_info(*cu)?);
            }
        }
        Ok(infos)
    }

    /// How many pools like `req` could be reserved right now.
    pub fn pool_available_count(&self, req: &PoolRequest) -> ResourceResult<u32> {
        req.validate(&self.limits)?;
        self.count_grants(|inv, scratch_id| carve(inv, PoolId(scratch_id.0), req).map(|_| ()))
    }
}
