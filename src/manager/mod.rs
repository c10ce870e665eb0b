// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! The resource manager service.
//!
//! One [`ResourceManager`] owns the inventory, pools, groups and leases
//! behind a single `RwLock`. Every mutation takes the write lock for its
//! whole search-and-commit; queries share the read lock. Device
//! programming runs outside the lock on a device marked as programming,
//! and the catalog is installed afterwards under it.

mod session;

pub use session::Session;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::allocator::{CuListRequest, CuRequest, CuResource, CuStatus, ReleaseDescriptor};
use crate::blocking::retry_until_granted;
use crate::constraint::{Constraints, DeviceConstraint};
use crate::error::{ResourceError, ResourceResult};
use crate::group::{GroupDefinition, GroupRegistry};
use crate::health::{HealthChecker, HealthConfig, HealthReport, HealthSample};
use crate::inventory::{CuInfo, CuMatcher, ImageProgrammer, Inventory};
use crate::ledger::LeaseLedger;
use crate::limits::ManagerLimits;
use crate::load::Load;
use crate::plugin::PluginRegistry;
use crate::pool::{PoolRequest, PoolReservationInfo, PoolTable};
use crate::telemetry::{self, OperationSpan, SpanExt};
use crate::types::{ClientId, CuRef, DeviceId, PoolId, ServiceId};

/// The only client API version accepted by [`ResourceManager::create_session`].
pub const API_VERSION: u32 = 1;

/// Client id used on spans of administrative calls.
const ADMIN_CLIENT: ClientId = ClientId(0);

/// Everything guarded by the manager lock.
#[derive(Debug)]
pub struct ManagerState {
    pub(crate) inventory: Inventory,
    pub(crate) pools: PoolTable,
    pub(crate) groups: GroupRegistry,
    pub(crate) ledger: LeaseLedger,
    pub(crate) limits: ManagerLimits,
}

impl ManagerState {
    pub fn new(limits: ManagerLimits) -> Self {
        let limits = limits.sanitized();
        Self {
            inventory: Inventory::new(limits.max_devices, limits.max_channels_per_cu),
            pools: PoolTable::new(),
            groups: GroupRegistry::new(),
            ledger: LeaseLedger::new(),
            limits,
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn ledger(&self) -> &LeaseLedger {
        &self.ledger
    }

    pub fn pools(&self) -> &PoolTable {
        &self.pools
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn limits(&self) -> &ManagerLimits {
        &self.limits
    }
}

/// What closing a client session cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSummary {
    pub leases_released: usize,
    pub pools_relinquished: usize,
    /// Pools left in place because other clients still lease from them.
    pub pools_kept: usize,
}

pub struct ResourceManager {
    state: RwLock<ManagerState>,
    sessions: DashMap<ClientId, DateTime<Utc>>,
    programmer: Arc<dyn ImageProgrammer>,
    plugins: PluginRegistry,
    health: HealthChecker,
    limits: ManagerLimits,
    next_client: AtomicU64,
    accepting: AtomicBool,
    started_at: Instant,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("sessions", &self.sessions.len())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Build an empty manager. Devices are added with
    /// [`enable_device`](Self::enable_device) and [`load_image`](Self::load_image).
    pub fn new(limits: ManagerLimits, programmer: Arc<dyn ImageProgrammer>) -> Self {
        let limits = limits.sanitized();
        Self {
            state: RwLock::new(ManagerState::new(limits.clone())),
            sessions: DashMap::new(),
            programmer,
            plugins: PluginRegistry::new(),
            health: HealthChecker::new(HealthConfig::default()),
            limits,
            next_client: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            started_at: Instant::now(),
        }
    }

    pub fn limits(&self) -> &ManagerLimits {
        &self.limits
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Run `f` against a consistent snapshot of the state.
    pub fn read<T>(&self, f: impl FnOnce(&ManagerState) -> T) -> T {
        f(&self.state.read())
    }

    // -- Lifecycle --------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting new allocations, reservations and sessions. Live
    /// leases stay until their holders release them.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            let state = self.state.read();
            tracing::info!(
                live_leases = state.ledger.len(),
                pools = state.pools.len(),
                sessions = self.sessions.len(),
                "resource manager stopped accepting requests"
            );
        }
    }

    fn ensure_accepting(&self) -> ResourceResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ResourceError::ShuttingDown)
        }
    }

    pub fn health_report(&self) -> HealthReport {
        let state = self.state.read();
        let devices: Vec<_> = state.inventory.devices().collect();
        let sample = HealthSample {
            accepting: self.is_running(),
            devices_enabled: devices.iter().filter(|d| d.enabled).count(),
            devices_loaded: devices.iter().filter(|d| d.is_ready()).count(),
            compute_units: devices.iter().map(|d| d.compute_units().len()).sum(),
            live_leases: state.ledger.len(),
            live_channels: state.inventory.live_channel_count(),
            pools: state.pools.len(),
            groups: state.groups.len(),
            sessions: self.sessions.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        };
        self.health.report(sample)
    }

    // -- Sessions ---------------------------------------------------------------

    /// Open a client session. Only [`API_VERSION`] is accepted.
    pub fn create_session(self: &Arc<Self>, api_version: u32) -> ResourceResult<Session> {
        let client_id = self.open_client(api_version)?;
        Ok(Session::new(Arc::clone(self), client_id))
    }

    pub(crate) fn open_client(&self, api_version: u32) -> ResourceResult<ClientId> {
        self.ensure_accepting()?;
        if api_version != API_VERSION {
            return Err(ResourceError::InvalidArgument(format!(
                "unsupported api version {}, expected {}",
                api_version, API_VERSION
            )));
        }
        let client_id = ClientId(self.next_client.fetch_add(1, Ordering::SeqCst));
        self.sessions.insert(client_id, Utc::now());
        tracing::debug!(client_id = client_id.0, "session opened");
        Ok(client_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Release every lease of a client and relinquish the pools it owns
    /// that nobody else leases from.
    pub fn close_client(&self, client_id: ClientId) -> ResourceResult<CloseSummary> {
        self.observe("close_session", client_id, || {
            if self.sessions.remove(&client_id).is_none() {
                return Err(ResourceError::SessionClosed(client_id.0));
            }
            let mut state = self.state.write();
            let mut summary = CloseSummary::default();

            for service_id in state.ledger.leases_of(client_id) {
                match state.release_service(service_id) {
                    Ok(lease) => {
                        summary.leases_released += 1;
                        telemetry::record_release(lease.channels.len());
                    }
                    Err(e) => tracing::error!(%service_id, error = %e, "lease release on close failed"),
                }
            }
            for pool_id in state.pools.owned_by(client_id) {
                match state.relinquish_pool(pool_id) {
                    Ok(()) => {
                        summary.pools_relinquished += 1;
                        telemetry::record_pool_relinquished();
                    }
                    Err(e) => {
                        summary.pools_kept += 1;
                        tracing::warn!(%pool_id, error = %e, "pool outlives its owner");
                    }
                }
            }
            telemetry::record_live_leases(state.ledger.len());
            Ok(summary)
        })
    }

    // -- Instrumentation ----------------------------------------------------------

    fn observe<T>(
        &self,
        op: &'static str,
        client_id: ClientId,
        f: impl FnOnce() -> ResourceResult<T>,
    ) -> ResourceResult<T> {
        let span = OperationSpan::new(op, client_id.0);
        let _entered = span.enter();
        let result = f();
        span.record_result(&result);
        if let Err(e) = &result {
            if e.is_warning() {
                tracing::debug!(op, error = %e, "operation refused");
            } else {
                tracing::warn!(op, error = %e, code = e.code(), "operation failed");
            }
        }
        result
    }

    /// Run a granting mutation under the write lock.
    fn grant<T>(
        &self,
        op: &'static str,
        client_id: ClientId,
        channels_of: impl Fn(&T) -> usize,
        f: impl FnOnce(&mut ManagerState) -> ResourceResult<T>,
    ) -> ResourceResult<T> {
        self.observe(op, client_id, || {
            self.ensure_accepting()?;
            let mut state = self.state.write();
            let result = f(&mut state);
            match &result {
                Ok(granted) => {
                    telemetry::record_allocation_granted(op, channels_of(granted));
                    telemetry::record_live_leases(state.ledger.len());
                }
                Err(e) => telemetry::record_allocation_failure(op, e.code()),
            }
            result
        })
    }

    // -- Device administration ----------------------------------------------------

    pub fn enable_device(&self, device_id: DeviceId) -> ResourceResult<()> {
        self.observe("enable_device", ADMIN_CLIENT, || {
            self.state.write().inventory.enable_device(device_id)?;
            tracing::info!(device_id, "device enabled");
            Ok(())
        })
    }

    pub fn disable_device(&self, device_id: DeviceId) -> ResourceResult<()> {
        self.observe("disable_device", ADMIN_CLIENT, || {
            self.state.write().inventory.disable_device(device_id)?;
            tracing::info!(device_id, "device disabled");
            Ok(())
        })
    }

    /// Program an image onto `target`, or onto an idle enabled device when
    /// `target` is `None`. Returns the device that was programmed.
    pub fn load_image(&self, target: Option<DeviceId>, path: &Path) -> ResourceResult<DeviceId> {
        self.observe("load_image", ADMIN_CLIENT, || {
            self.ensure_accepting()?;
            // Reserve the device under the write lock so a concurrent load
            // cannot pick it while the programmer runs unlocked.
            let device_id = {
                let mut state = self.state.write();
                let device_id = match target {
                    Some(id) => id,
                    None => state.inventory.idle_device_for_load().ok_or_else(|| {
                        ResourceError::NotFound("no idle enabled device to program".into())
                    })?,
                };
                state.inventory.begin_programming(device_id)?;
                device_id
            };

            let installed = self.programmer.program(device_id, path).and_then(|catalog| {
                self.state.write().inventory.install_image(device_id, &catalog)?;
                Ok(catalog)
            });
            let catalog = match installed {
                Ok(catalog) => catalog,
                Err(e) => {
                    self.state.write().inventory.abort_programming(device_id);
                    return Err(e);
                }
            };
            tracing::info!(
                device_id,
                path = %path.display(),
                uuid = %catalog.uuid,
                cus = catalog.compute_units.len(),
                "image loaded"
            );
            Ok(device_id)
        })
    }

    pub fn unload_image(&self, device_id: DeviceId) -> ResourceResult<()> {
        self.observe("unload_image", ADMIN_CLIENT, || {
            self.state.write().inventory.unload_image(device_id)?;
            tracing::info!(device_id, "image unloaded");
            Ok(())
        })
    }

    // -- Allocation -------------------------------------------------------------

    pub fn allocate_cu(&self, client_id: ClientId, req: &CuRequest) -> ResourceResult<CuResource> {
        self.grant("cu_alloc", client_id, |_| 1, |state| state.allocate_cu(client_id, req))
    }

    pub fn allocate_cu_from_device(
        &self,
        client_id: ClientId,
        device_id: DeviceId,
        req: &CuRequest,
    ) -> ResourceResult<CuResource> {
        self.grant("cu_alloc_from_dev", client_id, |_| 1, |state| {
            state.allocate_cu_from_device(client_id, device_id, req)
        })
    }

    pub fn allocate_cu_list(
        &self,
        client_id: ClientId,
        list: &CuListRequest,
    ) -> ResourceResult<Vec<CuResource>> {
        self.grant("cu_list_alloc", client_id, Vec::len, |state| state.allocate_cu_list(client_id, list))
    }

    pub fn allocate_cu_group(
        &self,
        client_id: ClientId,
        group_name: &str,
        pool_id: PoolId,
    ) -> ResourceResult<Vec<CuResource>> {
        self.grant("cu_group_alloc", client_id, Vec::len, |state| {
            state.allocate_cu_group(client_id, group_name, pool_id)
        })
    }

    /// Allocate, and when nothing matches, program `image` onto an idle
    /// device and allocate from it.
    pub fn allocate_cu_with_load(
        &self,
        client_id: ClientId,
        req: &CuRequest,
        image: &Path,
    ) -> ResourceResult<CuResource> {
        match self.allocate_cu(client_id, req) {
            Err(e) if e.is_insufficient_resources() => {
                tracing::debug!(client_id = client_id.0, error = %e, "allocation missed, loading image");
                let device_id = self.load_image(None, image)?;
                self.allocate_cu_from_device(client_id, device_id, req)
            }
            other => other,
        }
    }

    /// Program `image` onto an idle device and lease every CU on it at
    /// full capacity, exclusively, as one list lease.
    pub fn load_and_alloc_all(&self, client_id: ClientId, image: &Path) -> ResourceResult<Vec<CuResource>> {
        let device_id = self.load_image(None, image)?;
        self.grant("load_and_alloc_all", client_id, Vec::len, |state| {
            let pin = Constraints { device: DeviceConstraint::HardwareIndex(device_id), ..Default::default() };
            let members: Vec<CuRequest> = state
                .inventory
                .device(device_id)?
                .compute_units()
                .iter()
                .map(|cu| {
                    CuRequest::new(CuMatcher::cu_name(&cu.cu_name()), cu.max_capacity)
                        .exclusive()
                        .with_constraints(pin)
                })
                .collect();
            state.allocate_cu_list(client_id, &CuListRequest::new(members))
        })
    }

    /// Free a lease by quoting every channel it holds.
    pub fn release(&self, client_id: ClientId, descriptors: &[ReleaseDescriptor]) -> ResourceResult<()> {
        self.observe("cu_release", client_id, || {
            let mut state = self.state.write();
            let lease = state.release(descriptors)?;
            if lease.client_id != client_id {
                tracing::debug!(
                    owner = lease.client_id.0,
                    service_id = %lease.service_id,
                    "lease released by another client"
                );
            }
            telemetry::record_release(lease.channels.len());
            telemetry::record_live_leases(state.ledger.len());
            Ok(())
        })
    }

    // -- Blocking allocation ------------------------------------------------------

    pub async fn allocate_cu_blocking(
        &self,
        client_id: ClientId,
        req: &CuRequest,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<CuResource> {
        retry_until_granted(
            interval_us,
            cancel,
            || self.allocate_cu(client_id, req),
            |_| telemetry::record_blocking_retry("cu_alloc"),
        )
        .await
    }

    pub async fn allocate_cu_list_blocking(
        &self,
        client_id: ClientId,
        list: &CuListRequest,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<Vec<CuResource>> {
        retry_until_granted(
            interval_us,
            cancel,
            || self.allocate_cu_list(client_id, list),
            |_| telemetry::record_blocking_retry("cu_list_alloc"),
        )
        .await
    }

    pub async fn allocate_cu_group_blocking(
        &self,
        client_id: ClientId,
        group_name: &str,
        pool_id: PoolId,
        interval_us: u64,
        cancel: &CancellationToken,
    ) -> ResourceResult<Vec<CuResource>> {
        retry_until_granted(
            interval_us,
            cancel,
            || self.allocate_cu_group(client_id, group_name, pool_id),
            |_| telemetry::record_blocking_retry("cu_group_alloc"),
        )
        .await
    }

    // -- Groups -----------------------------------------------------------------

    pub fn declare_group(&self, definition: GroupDefinition) -> ResourceResult<()> {
        self.observe("udf_cu_group_declare", ADMIN_CLIENT, || {
            self.ensure_accepting()?;
            let mut state = self.state.write();
            let limits = state.limits.clone();
            let name = definition.name.clone();
            state.groups.declare(definition, &limits)?;
            tracing::info!(group = %name, "group declared");
            Ok(())
        })
    }

    pub fn undeclare_group(&self, name: &str) -> ResourceResult<()> {
        self.observe("udf_cu_group_undeclare", ADMIN_CLIENT, || {
            self.state.write().groups.undeclare(name)?;
            tracing::info!(group = name, "group undeclared");
            Ok(())
        })
    }

    // -- Pools ------------------------------------------------------------------

    pub fn reserve_pool(
        &self,
        client_id: ClientId,
        req: &PoolRequest,
    ) -> ResourceResult<(PoolId, PoolReservationInfo)> {
        self.observe("cu_pool_reserve", client_id, || {
            self.ensure_accepting()?;
            let (pool_id, info) = self.state.write().reserve_pool(client_id, req)?;
            telemetry::record_pool_reserved();
            tracing::info!(%pool_id, devices = ?info.devices, "pool reserved");
            Ok((pool_id, info))
        })
    }

    pub fn relinquish_pool(&self, client_id: ClientId, pool_id: PoolId) -> ResourceResult<()> {
        self.observe("cu_pool_relinquish", client_id, || {
            self.state.write().relinquish_pool(pool_id)?;
            telemetry::record_pool_relinquished();
            tracing::info!(%pool_id, "pool relinquished");
            Ok(())
        })
    }

    pub fn reservation_query(&self, pool_id: PoolId, filter: Option<&CuMatcher>) -> ResourceResult<Vec<CuInfo>> {
        self.state.read().reservation_query(pool_id, filter)
    }

    // -- Queries ------------------------------------------------------------------

    pub fn cu_available_count(&self, req: &CuRequest) -> ResourceResult<u32> {
        self.state.read().cu_available_count(req)
    }

    pub fn cu_list_available_count(&self, list: &CuListRequest) -> ResourceResult<u32> {
        self.state.read().cu_list_available_count(list)
    }

    pub fn cu_group_available_count(&self, group_name: &str, pool_id: PoolId) -> ResourceResult<u32> {
        self.state.read().cu_group_available_count(group_name, pool_id)
    }

    pub fn pool_available_count(&self, req: &PoolRequest) -> ResourceResult<u32> {
        self.state.read().pool_available_count(req)
    }

    pub fn cu_status(&self, cu: CuRef) -> ResourceResult<CuStatus> {
        self.state.read().cu_status(cu)
    }

    pub fn cu_max_capacity(&self, matcher: &CuMatcher) -> Load {
        self.state.read().cu_max_capacity(matcher)
    }

    pub fn allocation_query(
        &self,
        service_id: ServiceId,
        filter: Option<&CuMatcher>,
    ) -> ResourceResult<Vec<CuResource>> {
        self.state.read().allocation_query(service_id, filter)
    }

    // -- Extension functions ----------------------------------------------------

    pub fn exec_plugin(&self, plugin: &str, func_id: u32, input: &[u8]) -> ResourceResult<Vec<u8>> {
        self.observe("exec_plugin", ADMIN_CLIENT, || {
            self.ensure_accepting()?;
            self.plugins.execute(plugin, func_id, input, self.limits.max_plugin_param_len)
        })
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
