// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! accel-rm: compute unit resource manager for hardware accelerators.
//!
//! Devices are programmed with images that expose compute units (CUs).
//! Clients lease fractional or exclusive capacity on those CUs, reserve
//! whole CUs into private pools and declare named groups of alternative
//! CU lists. All state lives in one [`ResourceManager`] guarded by a single
//! lock, so every grant and release is atomic.
//!
//! # Layout
//!
//! - [`inventory`]: devices, CUs and channels with their current load
//! - [`allocator`]: placement of single, list and group requests
//! - [`pool`], [`group`], [`ledger`]: reservations, declarations, leases
//! - [`manager`]: the locked state, sessions and instrumentation
//! - [`request`]: V1/V2 request shapes decoded at the boundary
//! - [`ipc`], [`cli`]: the daemon socket and its client

pub mod allocator;
pub mod blocking;
pub mod cli;
pub mod config;
pub mod constraint;
pub mod error;
pub mod group;
pub mod health;
pub mod inventory;
pub mod ipc;
pub mod ledger;
pub mod limits;
pub mod load;
pub mod manager;
pub mod plugin;
pub mod pool;
pub mod request;
pub mod shutdown;
pub mod telemetry;
pub mod types;

use std::sync::Arc;

pub use allocator::{CuListRequest, CuRequest, CuResource, CuStatus, ReleaseDescriptor};
pub use error::{ResourceError, ResourceResult};
pub use inventory::{CuMatcher, ImageProgrammer, ManifestProgrammer, StaticProgrammer};
pub use limits::ManagerLimits;
pub use load::{Granularity, Load};
pub use manager::{CloseSummary, ResourceManager, Session, API_VERSION};
pub use types::{ClientId, DeviceId, PoolId, ServiceId};

use config::EnvConfig;
use ipc::{ConnectionPool, IpcHandler, IpcHandlerConfig};
use shutdown::ShutdownCoordinator;

/// What [`Runtime::boot`] brought up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootSummary {
    pub devices_enabled: Vec<DeviceId>,
    /// Device each boot image landed on, in configuration order.
    pub images_loaded: Vec<DeviceId>,
}

/// The daemon's long-lived components, wired from one configuration.
pub struct Runtime {
    pub config: EnvConfig,
    pub manager: Arc<ResourceManager>,
    pub ipc_handler: Arc<IpcHandler>,
    pub connections: Arc<ConnectionPool>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl Runtime {
    pub fn new(config: EnvConfig, programmer: Arc<dyn ImageProgrammer>) -> Self {
        let manager = Arc::new(ResourceManager::new(config.limits.clone(), programmer));
        let ipc_handler = Arc::new(IpcHandler::new(
            Arc::clone(&manager),
            IpcHandlerConfig { max_message_size: config.ipc_server.max_frame_size },
        ));
        let connections = ConnectionPool::new(config.connections.clone());
        Self {
            config,
            manager,
            ipc_handler,
            connections,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Enable the configured devices and program the boot images.
    pub fn boot(&self) -> ResourceResult<BootSummary> {
        let mut summary = BootSummary::default();
        for &device_id in &self.config.boot.devices {
            self.manager.enable_device(device_id)?;
            summary.devices_enabled.push(device_id);
        }
        for image in &self.config.boot.images {
            let device_id = self.manager.load_image(image.device, &image.path)?;
            tracing::info!(device_id, image = %image.path.display(), "boot image loaded");
            summary.images_loaded.push(device_id);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootImage;
    use crate::inventory::{CuDescriptor, ImageCatalog};
    use std::path::PathBuf;

    fn programmer() -> Arc<StaticProgrammer> {
        let catalog = ImageCatalog::new(
            uuid::Uuid::from_u128(0xB007),
            "/images/boot.json",
            vec![CuDescriptor::new("enc", "enc_0")],
        );
        Arc::new(StaticProgrammer::new().with_image(catalog))
    }

    #[test]
    fn boot_enables_devices_and_loads_images() {
        let mut config = EnvConfig::default();
        config.boot.devices = vec![0, 1];
        config.boot.images = vec![
            BootImage { device: Some(1), path: PathBuf::from("/images/boot.json") },
            BootImage { device: None, path: PathBuf::from("/images/boot.json") },
        ];
        let runtime = Runtime::new(config, programmer());
        let summary = runtime.boot().unwrap();
        assert_eq!(summary.devices_enabled, vec![0, 1]);
        assert_eq!(summary.images_loaded, vec![1, 0]);
        assert_eq!(runtime.manager.health_report().devices_loaded, 2);
    }

    #[test]
    fn boot_fails_on_unknown_image() {
        let mut config = EnvConfig::default();
        config.boot.images =
            vec![BootImage { device: Some(0), path: PathBuf::from("/images/missing.json") }];
        let runtime = Runtime::new(config, programmer());
        assert!(runtime.boot().is_err());
    }
}
