// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Client sessions.
//!
//! A session is the client's handle on the manager. Request shapes are
//! decoded here and nowhere else. Dropping a session closes it, which
//! releases its leases and relinquishes the pools only it uses.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{CloseSummary, ResourceManager};
use crate::allocator::{CuResource, ReleaseDescriptor};
use crate::error::{ResourceError, ResourceResult};
use crate::inventory::{CuInfo, CuMatcher};
use crate::load::Load;
use crate::pool::PoolReservationInfo;
use crate::request::{
    AllocationQueryInfo, CuGroupProperty, CuListProperty, CuListPropertyV2, CuPoolProperty,
    CuPoolPropertyV2, CuProperty, CuPropertyV2, CuStat, ReservationQueryInfo, UdfCuGroupProperty,
    UdfCuGroupPropertyV2,
};
use crate::types::{ClientId, CuRef, DeviceId, PoolId, ServiceId};

pub struct Session {
    manager: Arc<ResourceManager>,
    client_id: ClientId,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Session {
    pub(super) fn new(manager: Arc<ResourceManager>, client_id: ClientId) -> Self {
        Self { manager, client_id, closed: AtomicBool::new(false) }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn live(&self) -> ResourceResult<ClientId> {
        if self.is_open() {
            Ok(self.client_id)
        } else {
            Err(ResourceError::SessionClosed(self.client_id.0))
        }
    }

    /// Close the session now instead of on drop.
    pub fn close(&self) -> ResourceResult<CloseSummary> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ResourceError::SessionClosed(self.client_id.0));
        }
        self.manager.close_client(self.client_id)
    }

    pub fn is_daemon_running(&self) -> bool {
        self.manager.is_running()
    }

    // -- Devices ----------------------------------------------------------------

    pub fn enable_device(&self, device_id: DeviceId) -> ResourceResult<()> {
        self.live()?;
        self.manager.enable_device(device_id)
    }

    pub fn disable_device(&self, device_id: DeviceId) -> ResourceResult<()> {
        self.live()?;
        self.manager.disable_device(device_id)
    }

    /// Program an image. `None` picks an idle enabled device.
    pub fn load_image(&self, device_id: Option<DeviceId>, path: &Path) -> ResourceResult<DeviceId> {
        self.live()?;
        self.manager.load_image(device_id, path)
    }

    pub fn unload_image(&self, device_id: DeviceId) -> ResourceResult<()> {
        self.live()?;
        self.manager.unload_image(device_id)
    }

    // -- Single CU ----------------------------------------------------------------

    pub fn cu_alloc(&self, prop: &CuProperty) -> ResourceResult<CuResource> {
        let client = self.live()?;
        self.manager.allocate_cu(client, &prop.decode()?)
    }

    pub fn cu_alloc_v2(&self, prop: &CuPropertyV2) -> ResourceResult<CuResource> {
        let client = self.live()?;
        self.manager.allocate_cu(client, &prop.decode()?)
    }

    pub fn cu_alloc_from_dev(&self, device_id: DeviceId, prop: &CuProperty) -> ResourceResult<CuResource> {
        let client = self.live()?;
        self.manager.allocate_cu_from_device(client, device_id, &prop.decode()?)
    }

    pub fn cu_alloc_from_dev_v2(&self, device_id: DeviceId, prop: &CuPropertyV2) -> ResourceResult<CuResource> {
        let client = self.live()?;
        self.manager.allocate_cu_from_device(client, device_id, &prop.decode()?)
    }

    pub fn cu_alloc_with_load(&self, prop: &CuProperty, image: &Path) -> ResourceResult<CuResource> {
        let client = self.live()?;
        self.manager.allocate_cu_with_load(client, &prop.decode()?, image)
    }

    pub fn cu_release(&self, resource: &CuResource) -> ResourceResult<()> {
        let client = self.live()?;
        self.manager.release(client, &[resource.descriptor()])
    }

    // -- Lists and groups ---------------------------------------------------------

    pub fn cu_list_alloc(&self, prop: &CuListProperty) -> ResourceResult<Vec<CuResource>> {
        let client = self.live()?;
        self.manager.allocate_cu_list(client, &prop.decode()?)
    }

    pub fn cu_list_alloc_v2(&self, prop: &CuListPropertyV2) -> ResourceResult<Vec<CuResource>> {
        let client = self.live()?;
        self.manager.allocate_cu_list(client, &prop.decode()?)
    }

    /// Release a list or group lease. Every resource of the lease must be
    /// named.
    pub fn cu_list_release(&self, resources: &[CuResource]) -> ResourceResult<()> {
        let client = self.live()?;
        let descriptors: Vec<ReleaseDescriptor> = resources.iter().map(CuResource::descriptor).collect();
        self.manager.release(client, &descriptors)
    }

    pub fn cu_group_alloc(&self, prop: &CuGroupProperty) -> ResourceResult<Vec<CuResource>> {
        let client = self.live()?;
        self.manager.allocate_cu_group(client, &prop.udf_cu_group_name, PoolId(prop.pool_id))
    }

    pub fn cu_group_release(&self, resources: &[CuResource]) -> ResourceResult<()> {
        self.cu_list_release(resources)
    }

    pub fn udf_cu_group_declare(&self, name: &str, prop: &UdfCuGroupProperty) -> ResourceResult<()> {
        self.live()?;
        self.manager.declare_group(prop.decode(name)?)
    }

    pub fn udf_cu_group_declare_v2(&self, name: &str, prop: &UdfCuGroupPropertyV2) -> ResourceResult<()> {
        self.live()?;
        self.manager.declare_group(prop.decode(name)?)
    }

    pub fn udf_cu_group_undeclare(&self, name: &str) -> ResourceResult<()> {
        self.live()?;
        self.manager.undeclare_group(name)
    }

    /// Program an idle device and lease all of it.
    pub fn load_and_alloc_all(&self, image: &Path) -> ResourceResult<Vec<CuResource>> {
        let client = self.live()?;
        self.manager.load_and_alloc_all(client, image)
    }

    // -- Blocking ---------------------------------------------------------------

    pub async fn cu_blocking_alloc(
        &self,
        prop: &CuProperty,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<CuResource> {
        let client = self.live()?;
        let req = prop.decode()?;
        self.manager.allocate_cu_blocking(client, &req, interval_us, cancel).await
    }

    pub async fn cu_blocking_alloc_v2(
        &self,
        prop: &CuPropertyV2,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<CuResource> {
        let client = self.live()?;
        let req = prop.decode()?;
        self.manager.allocate_cu_blocking(client, &req, interval_us, cancel).await
    }

    pub async fn cu_list_blocking_alloc(
        &self,
        prop: &CuListProperty,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<Vec<CuResource>> {
        let client = self.live()?;
        let list = prop.decode()?;
        self.manager.allocate_cu_list_blocking(client, &list, interval_us, cancel).await
    }

    pub async fn cu_list_blocking_alloc_v2(
        &self,
        prop: &CuListPropertyV2,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<Vec<CuResource>> {
        let client = self.live()?;
        let list = prop.decode()?;
        self.manager.allocate_cu_list_blocking(client, &list, interval_us, cancel).await
    }

    pub async fn cu_group_blocking_alloc(
        &self,
        prop: &CuGroupProperty,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<Vec<CuResource>> {
        let client = self.live()?;
        self.manager
            .allocate_cu_group_blocking(client, &prop.udf_cu_group_name, PoolId(prop.pool_id), interval_us, cancel)
            .await
    }

    // -- Available counts -------------------------------------------------------

    pub fn check_cu_available_num(&self, prop: &CuProperty) -> ResourceResult<u32> {
        self.live()?;
        self.manager.cu_available_count(&prop.decode()?)
    }

    pub fn check_cu_available_num_v2(&self, prop: &CuPropertyV2) -> ResourceResult<u32> {
        self.live()?;
        self.manager.cu_available_count(&prop.decode()?)
    }

    pub fn check_cu_list_available_num(&self, prop: &CuListProperty) -> ResourceResult<u32> {
        self.live()?;
        self.manager.cu_list_available_count(&prop.decode()?)
    }

    pub fn check_cu_list_available_num_v2(&self, prop: &CuListPropertyV2) -> ResourceResult<u32> {
        self.live()?;
        self.manager.cu_list_available_count(&prop.decode()?)
    }

    pub fn check_cu_group_available_num(&self, prop: &CuGroupProperty) -> ResourceResult<u32> {
        self.live()?;
        self.manager.cu_group_available_count(&prop.udf_cu_group_name, PoolId(prop.pool_id))
    }

    pub fn check_cu_pool_available_num(&self, prop: &CuPoolProperty) -> ResourceResult<u32> {
        self.live()?;
        self.manager.pool_available_count(&prop.decode()?)
    }

    pub fn check_cu_pool_available_num_v2(&self, prop: &CuPoolPropertyV2) -> ResourceResult<u32> {
        self.live()?;
        self.manager.pool_available_count(&prop.decode()?)
    }

    // -- Pools ------------------------------------------------------------------

    pub fn cu_pool_reserve(&self, prop: &CuPoolProperty) -> ResourceResult<PoolId> {
        let client = self.live()?;
        self.manager.reserve_pool(client, &prop.decode()?).map(|(pool_id, _)| pool_id)
    }

    pub fn cu_pool_reserve_v2(&self, prop: &CuPoolPropertyV2) -> ResourceResult<(PoolId, PoolReservationInfo)> {
        let client = self.live()?;
        self.manager.reserve_pool(client, &prop.decode()?)
    }

    pub fn cu_pool_relinquish(&self, pool_id: PoolId) -> ResourceResult<()> {
        let client = self.live()?;
        self.manager.relinquish_pool(client, pool_id)
    }

    pub fn reservation_query(&self, info: &ReservationQueryInfo) -> ResourceResult<Vec<CuInfo>> {
        self.live()?;
        self.manager.reservation_query(PoolId(info.pool_id), info.kernel_filter().as_ref())
    }

    // -- Status -----------------------------------------------------------------

    pub fn allocation_query(&self, info: &AllocationQueryInfo) -> ResourceResult<Vec<CuResource>> {
        self.live()?;
        self.manager
            .allocation_query(ServiceId(info.alloc_service_id), info.kernel_filter().as_ref())
    }

    /// Busy flag and used load of the CU behind `resource`, in the scale the
    /// resource was granted in.
    pub fn cu_check_status(&self, resource: &CuResource) -> ResourceResult<CuStat> {
        self.live()?;
        let status = self.manager.cu_status(CuRef { device_id: resource.cu.device_id, cu_id: resource.cu.cu_id })?;
        Ok(CuStat::encode(status, resource.granularity))
    }

    pub fn cu_get_max_capacity(&self, prop: &CuProperty) -> ResourceResult<Load> {
        self.live()?;
        let matcher = CuMatcher::Kernel { name: prop.kernel_name.clone(), alias: prop.kernel_alias.clone() };
        matcher.validate(self.manager.limits().max_name_len)?;
        Ok(self.manager.cu_max_capacity(&matcher))
    }

    // -- Extension functions ----------------------------------------------------

    pub fn exec_plugin(&self, plugin: &str, func_id: u32, input: &[u8]) -> ResourceResult<Vec<u8>> {
        self.live()?;
        self.manager.exec_plugin(plugin, func_id, input)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.manager.close_client(self.client_id) {
                tracing::warn!(client_id = self.client_id.0, error = %e, "session close on drop failed");
            }
        }
    }
}
