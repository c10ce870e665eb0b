// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! CU allocation: single CUs, CU lists and user-defined groups.
//!
//! Every entry point here runs with the manager's write lock held for the
//! whole search-and-commit, so two callers can never both see the last unit
//! of capacity. Queries run against a read lock and never mutate.

pub(crate) mod placement;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::constraint::Constraints;
use crate::error::{ResourceError, ResourceResult};
use crate::inventory::{CandidateFilter, CuInfo, CuMatcher, Inventory};
use crate::ledger::{Lease, LeaseKind};
use crate::limits::ManagerLimits;
use crate::load::{Granularity, Load};
use crate::manager::ManagerState;
use crate::request::Reserved;
use crate::types::{ChannelId, ChannelRef, ClientId, CuRef, DeviceId, PoolId, ServiceId};

use placement::{place_list, place_single, LeasePlacer};

/// Client id recorded on channels opened by dry-run counting.
const SIMULATION_CLIENT: ClientId = ClientId(0);

/// A request for one CU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuRequest {
    pub matcher: CuMatcher,
    /// Lock the whole device for this lease.
    pub exclusive: bool,
    pub load: Load,
    pub granularity: Granularity,
    pub constraints: Constraints,
    pub pool_id: PoolId,
}

impl CuRequest {
    pub fn new(matcher: CuMatcher, load: Load) -> Self {
        Self {
            matcher,
            exclusive: false,
            load,
            granularity: Granularity::Percent,
            constraints: Constraints::default(),
            pool_id: PoolId::DEFAULT,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn in_pool(mut self, pool_id: PoolId) -> Self {
        self.pool_id = pool_id;
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn validate(&self, limits: &ManagerLimits) -> ResourceResult<()> {
        self.matcher.validate(limits.max_name_len)?;
        if self.load.is_zero() {
            return Err(ResourceError::InvalidArgument("request load must be non-zero".into()));
        }
        Ok(())
    }
}

/// A request for several CUs granted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuListRequest {
    pub members: Vec<CuRequest>,
    /// Place the whole list on one device.
    pub same_device: bool,
}

impl CuListRequest {
    pub fn new(members: Vec<CuRequest>) -> Self {
        Self { members, same_device: false }
    }

    pub fn same_device(mut self) -> Self {
        self.same_device = true;
        self
    }

    /// Pool every member draws from. Validation guarantees they agree.
    pub fn pool_id(&self) -> PoolId {
        self.members.first().map_or(PoolId::DEFAULT, |m| m.pool_id)
    }

    pub(crate) fn in_pool(&self, pool_id: PoolId) -> Self {
        let members = self.members.iter().cloned().map(|m| m.in_pool(pool_id)).collect();
        Self { members, same_device: self.same_device }
    }

    pub fn validate(&self, limits: &ManagerLimits) -> ResourceResult<()> {
        if self.members.is_empty() {
            return Err(ResourceError::InvalidArgument("cu list is empty".into()));
        }
        if self.members.len() > limits.max_list_cus {
            return Err(ResourceError::InvalidArgument(format!(
                "cu list has {} members, limit is {}",
                self.members.len(),
                limits.max_list_cus
            )));
        }
        let pool_id = self.pool_id();
        if self.members.iter().any(|m| m.pool_id != pool_id) {
            return Err(ResourceError::InvalidArgument(
                "cu list members draw from different pools".into(),
            ));
        }
        self.members.iter().try_for_each(|m| m.validate(limits))
    }
}

/// One granted channel, described from the inventory at grant time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuResource {
    #[serde(flatten)]
    pub cu: CuInfo,
    pub channel_id: ChannelId,
    pub service_id: ServiceId,
    pub load: Load,
    pub granularity: Granularity,
    pub pool_id: PoolId,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuResource {
    pub fn channel(&self) -> ChannelRef {
        ChannelRef { device_id: self.cu.device_id, cu_id: self.cu.cu_id, channel_id: self.channel_id }
    }

    /// Load in the scale the caller requested it in.
    pub fn channel_load(&self) -> i32 {
        self.load.encode(self.granularity)
    }

    pub fn descriptor(&self) -> ReleaseDescriptor {
        ReleaseDescriptor { channel: self.channel(), service_id: self.service_id }
    }
}

/// Identifying fields a release must quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub channel: ChannelRef,
    pub service_id: ServiceId,
}

/// Busy flag and used load of one CU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuStatus {
    pub is_busy: bool,
    pub used_load: Load,
}

impl ManagerState {
    fn ensure_pool(&self, pool_id: PoolId) -> ResourceResult<()> {
        if pool_id.is_default() || self.pools.contains(pool_id) {
            Ok(())
        } else {
            Err(ResourceError::NotFound(format!("pool {}", pool_id)))
        }
    }

    pub(crate) fn resources(&self, service_id: ServiceId, channels: &[ChannelRef]) -> ResourceResult<Vec<CuResource>> {
        channels
            .iter()
            .map(|ch| {
                let live = self
                    .inventory
                    .channel(*ch)
                    .ok_or_else(|| ResourceError::StaleDescriptor(format!("channel {}", ch)))?;
                Ok(CuResource {
                    cu: self.inventory.cu_info(ch.cu())?,
                    channel_id: ch.channel_id,
                    service_id,
                    load: live.load,
                    granularity: live.granularity,
                    pool_id: live.pool_id,
                    ext_data: Reserved,
                })
            })
            .collect()
    }

    fn record_lease(
        &mut self,
        service_id: ServiceId,
        client_id: ClientId,
        pool_id: PoolId,
        kind: LeaseKind,
        group_name: Option<String>,
        channels: Vec<ChannelRef>,
    ) -> ResourceResult<Vec<CuResource>> {
        let resources = self.resources(service_id, &channels)?;
        self.ledger.record(Lease {
            service_id,
            client_id,
            pool_id,
            kind,
            group_name,
            channels,
            granted_at: Utc::now(),
        });
        Ok(resources)
    }

    fn allocate_filtered(
        &mut self,
        client_id: ClientId,
        req: &CuRequest,
        base: &CandidateFilter,
    ) -> ResourceResult<CuResource> {
        req.validate(&self.limits)?;
        self.ensure_pool(req.pool_id)?;
        let service_id = self.ledger.next_service_id();
        let mut placer = LeasePlacer { service_id, client_id };
        let channel = place_single(&mut self.inventory, &mut placer, req, base)?;
        let mut granted =
            self.record_lease(service_id, client_id, req.pool_id, LeaseKind::Cu, None, vec![channel])?;
        granted
            .pop()
            .ok_or_else(|| ResourceError::NotFound(format!("no {} available", req.matcher)))
    }

    /// Lease one CU matching `req`.
    pub fn allocate_cu(&mut self, client_id: ClientId, req: &CuRequest) -> ResourceResult<CuResource> {
        self.allocate_filtered(client_id, req, &CandidateFilter::default())
    }

    /// Lease one CU on a named device.
    pub fn allocate_cu_from_device(
        &mut self,
        client_id: ClientId,
        device_id: DeviceId,
        req: &CuRequest,
    ) -> ResourceResult<CuResource> {
        self.inventory.device(device_id)?;
        let base = CandidateFilter { device: Some(device_id), ..Default::default() };
        self.allocate_filtered(client_id, req, &base)
    }

    /// Lease every member of `list` under one service id, or nothing.
    pub fn allocate_cu_list(
        &mut self,
        client_id: ClientId,
        list: &CuListRequest,
    ) -> ResourceResult<Vec<CuResource>> {
        list.validate(&self.limits)?;
        self.ensure_pool(list.pool_id())?;
        let service_id = self.ledger.next_service_id();
        let mut placer = LeasePlacer { service_id, client_id };
        let placed = place_list(&mut self.inventory, &mut placer, list, &CandidateFilter::default())?;
        let channels = placed.into_iter().map(|p| p.token).collect();
        self.record_lease(service_id, client_id, list.pool_id(), LeaseKind::CuList, None, channels)
    }

    /// Lease the first option of a declared group that fits entirely.
    pub fn allocate_cu_group(
        &mut self,
        client_id: ClientId,
        group_name: &str,
        pool_id: PoolId,
    ) -> ResourceResult<Vec<CuResource>> {
        self.ensure_pool(pool_id)?;
        let options = self.groups.get(group_name)?.options.clone();
        let service_id = self.ledger.next_service_id();
        let mut placer = LeasePlacer { service_id, client_id };

        for (idx, option) in options.iter().enumerate() {
            let list = option.in_pool(pool_id);
            match place_list(&mut self.inventory, &mut placer, &list, &CandidateFilter::default()) {
                Ok(placed) => {
                    tracing::debug!(group = group_name, option = idx, "group option granted");
                    let channels = placed.into_iter().map(|p| p.token).collect();
                    return self.record_lease(
                        service_id,
                        client_id,
                        pool_id,
                        LeaseKind::CuGroup,
                        Some(group_name.to_string()),
                        channels,
                    );
                }
                Err(e) => {
                    tracing::debug!(group = group_name, option = idx, error = %e, "group option rejected")
                }
            }
        }
        Err(ResourceError::NotFound(format!(
            "no option of group {} can be satisfied",
            group_name
        )))
    }

    /// Free a whole lease. The descriptors must name exactly the live
    /// channels of one lease; anything else changes nothing.
    pub fn release(&mut self, descriptors: &[ReleaseDescriptor]) -> ResourceResult<Lease> {
        let service_id = descriptors
            .first()
            .map(|d| d.service_id)
            .ok_or_else(|| ResourceError::InvalidArgument("release names no channels".into()))?;
        if descriptors.iter().any(|d| d.service_id != service_id) {
            return Err(ResourceError::StaleDescriptor(
                "descriptors span several service ids".into(),
            ));
        }
        let lease = self.ledger.get(service_id).ok_or_else(|| {
            ResourceError::StaleDescriptor(format!("service id {} is not live", service_id))
        })?;

        let mut named: Vec<ChannelRef> = descriptors.iter().map(|d| d.channel).collect();
        named.sort_unstable();
        let mut held = lease.channels.clone();
        held.sort_unstable();
        if named != held {
            return Err(ResourceError::StaleDescriptor(format!(
                "descriptors do not match the channels of service id {}",
                service_id
            )));
        }
        if let Some(ch) = held
            .iter()
            .find(|ch| self.inventory.channel(**ch).map(|c| c.service_id) != Some(service_id))
        {
            return Err(ResourceError::StaleDescriptor(format!("channel {} is not live", ch)));
        }

        for ch in &held {
            self.inventory.release_load(*ch, service_id)?;
        }
        self.ledger.remove(service_id).ok_or_else(|| {
            ResourceError::StaleDescriptor(format!("service id {} is not live", service_id))
        })
    }

    /// Release every channel of a lease by service id.
    pub(crate) fn release_service(&mut self, service_id: ServiceId) -> ResourceResult<Lease> {
        let descriptors: Vec<ReleaseDescriptor> = self
            .ledger
            .get(service_id)
            .map(|l| l.channels.iter().map(|ch| ReleaseDescriptor { channel: *ch, service_id }).collect())
            .unwrap_or_default();
        self.release(&descriptors)
    }

    // -- Dry-run counting -------------------------------------------------------

    /// Repeat `attempt` on a scratch copy of the inventory until it fails.
    pub(crate) fn count_grants<F>(&self, mut attempt: F) -> ResourceResult<u32>
    where
        F: FnMut(&mut Inventory, ServiceId) -> ResourceResult<()>,
    {
        let mut scratch = self.inventory.clone();
        let mut count: u32 = 0;
        loop {
            let service_id = ServiceId(u64::MAX - u64::from(count));
            match attempt(&mut scratch, service_id) {
                Ok(()) => count += 1,
                Err(
                    e @ (ResourceError::InvalidArgument(_)
                    | ResourceError::InvalidConstraint(_)
                    | ResourceError::InvalidLoadEncoding(_)),
                ) => return Err(e),
                Err(_) => return Ok(count),
            }
        }
    }

    /// How many independent grants of `req` would succeed right now.
    pub fn cu_available_count(&self, req: &CuRequest) -> ResourceResult<u32> {
        req.validate(&self.limits)?;
        self.ensure_pool(req.pool_id)?;
        self.count_grants(|inv, service_id| {
            let mut placer = LeasePlacer { service_id, client_id: SIMULATION_CLIENT };
            place_single(inv, &mut placer, req, &CandidateFilter::default()).map(|_| ())
        })
    }

    pub fn cu_list_available_count(&self, list: &CuListRequest) -> ResourceResult<u32> {
        list.validate(&self.limits)?;
        self.ensure_pool(list.pool_id())?;
        self.count_grants(|inv, service_id| {
            let mut placer = LeasePlacer { service_id, client_id: SIMULATION_CLIENT };
            place_list(inv, &mut placer, list, &CandidateFilter::default()).map(|_| ())
        })
    }

    pub fn cu_group_available_count(&self, group_name: &str, pool_id: PoolId) -> ResourceResult<u32> {
        self.ensure_pool(pool_id)?;
        let options: Vec<CuListRequest> = self
            .groups
            .get(group_name)?
            .options
            .iter()
            .map(|o| o.in_pool(pool_id))
            .collect();
        self.count_grants(|inv, service_id| {
            let mut placer = LeasePlacer { service_id, client_id: SIMULATION_CLIENT };
            for option in &options {
                if place_list(inv, &mut placer, option, &CandidateFilter::default()).is_ok() {
                    return Ok(());
                }
            }
            Err(ResourceError::NotFound(group_name.to_string()))
        })
    }

    // -- Status queries ---------------------------------------------------------

    pub fn cu_status(&self, cu: CuRef) -> ResourceResult<CuStatus> {
        let unit = self.inventory.cu(cu)?;
        Ok(CuStatus { is_busy: !unit.is_idle(), used_load: unit.used_load() })
    }

    /// Largest declared capacity among ready CUs matching `matcher`; zero
    /// when none match.
    pub fn cu_max_capacity(&self, matcher: &CuMatcher) -> Load {
        self.inventory
            .devices()
            .filter(|d| d.is_ready())
            .flat_map(|d| d.compute_units().iter())
            .filter(|cu| matcher.matches(cu))
            .map(|cu| cu.max_capacity)
            .max()
            .unwrap_or(Load::ZERO)
    }

    /// Resources of a live lease, optionally narrowed to one kernel.
    pub fn allocation_query(
        &self,
        service_id: ServiceId,
        filter: Option<&CuMatcher>,
    ) -> ResourceResult<Vec<CuResource>> {
        let lease = self
            .ledger
            .get(service_id)
            .ok_or_else(|| ResourceError::NotFound(format!("service id {}", service_id)))?;
        let mut resources = self.resources(service_id, &lease.channels)?;
        if let Some(matcher) = filter {
            resources.retain(|r| {
                self.inventory.cu(r.channel().cu()).map_or(false, |cu| matcher.matches(cu))
            });
        }
        Ok(resources)
    }
}

#[cfg(test)]
#[path = "allocator_tests.rs"]
mod tests;
