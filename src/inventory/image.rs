// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Image catalogs and the device-programming collaborator.
//!
//! Programming a device is delegated to an [`ImageProgrammer`]. The manager
//! only needs the CU catalog the programmer extracts from the image.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ResourceError;
use crate::load::Load;
use crate::types::{CuType, DeviceId, MemoryBank};

/// One CU declared by an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuDescriptor {
    pub kernel_name: String,
    #[serde(default)]
    pub kernel_alias: String,
    pub instance_name: String,
    #[serde(default)]
    pub cu_type: CuType,
    #[serde(default)]
    pub base_addr: u64,
    #[serde(default)]
    pub mem_bank: MemoryBank,
    #[serde(default)]
    pub plugin_file_name: String,
    /// Capacity in fine-scale load units. Full scale when absent.
    #[serde(default)]
    pub max_capacity: Option<u32>,
}

impl CuDescriptor {
    pub fn new(kernel_name: &str, instance_name: &str) -> Self {
        Self {
            kernel_name: kernel_name.to_string(),
            kernel_alias: String::new(),
            instance_name: instance_name.to_string(),
            cu_type: CuType::IpKernel,
            base_addr: 0,
            mem_bank: MemoryBank::default(),
            plugin_file_name: String::new(),
            max_capacity: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.kernel_alias = alias.to_string();
        self
    }

    pub fn with_bank(mut self, bank_id: u32) -> Self {
        self.mem_bank.id = bank_id;
        self
    }

    pub fn with_capacity(mut self, capacity: Load) -> Self {
        self.max_capacity = Some(capacity.units());
        self
    }

    pub(crate) fn capacity(&self) -> Load {
        self.max_capacity
            .and_then(|units| Load::from_units(units).ok())
            .unwrap_or(Load::FULL)
    }
}

/// CU catalog extracted from one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCatalog {
    pub uuid: Uuid,
    pub path: PathBuf,
    pub compute_units: Vec<CuDescriptor>,
}

impl ImageCatalog {
    pub fn new(uuid: Uuid, path: impl Into<PathBuf>, compute_units: Vec<CuDescriptor>) -> Self {
        Self { uuid, path: path.into(), compute_units }
    }

    /// Reject catalogs the inventory cannot represent.
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.compute_units.is_empty() {
            return Err(ResourceError::ImageLoad(format!(
                "{} declares no compute units",
                self.path.display()
            )));
        }
        for cu in &self.compute_units {
            if cu.kernel_name.is_empty() || cu.instance_name.is_empty() {
                return Err(ResourceError::ImageLoad(format!(
                    "{} declares a compute unit without kernel or instance name",
                    self.path.display()
                )));
            }
            match cu.max_capacity {
                Some(0) => {
                    return Err(ResourceError::ImageLoad(format!(
                        "{}:{} declares zero capacity",
                        cu.kernel_name, cu.instance_name
                    )))
                }
                Some(units) if Load::from_units(units).is_err() => {
                    return Err(ResourceError::ImageLoad(format!(
                        "{}:{} capacity {} exceeds full scale",
                        cu.kernel_name, cu.instance_name, units
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Programs a device with an image and reports its CU catalog.
pub trait ImageProgrammer: Send + Sync {
    fn program(&self, device_id: DeviceId, path: &Path) -> Result<ImageCatalog, ResourceError>;
}

/// On-disk JSON description of an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub uuid: Uuid,
    pub compute_units: Vec<CuDescriptor>,
}

/// Programmer that reads a JSON manifest describing the image.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestProgrammer;

impl ImageProgrammer for ManifestProgrammer {
    fn program(&self, device_id: DeviceId, path: &Path) -> Result<ImageCatalog, ResourceError> {
        let bytes = std::fs::read(path)
            .map_err(|e| ResourceError::ImageLoad(format!("{}: {}", path.display(), e)))?;
        let manifest: ImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| ResourceError::ImageLoad(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(
            device_id,
            path = %path.display(),
            uuid = %manifest.uuid,
            cus = manifest.compute_units.len(),
            "image manifest parsed"
        );
        Ok(ImageCatalog::new(manifest.uuid, path, manifest.compute_units))
    }
}

/// Programmer serving catalogs registered in memory, keyed by path.
#[derive(Debug, Default, Clone)]
pub struct StaticProgrammer {
    images: HashMap<PathBuf, ImageCatalog>,
}

impl StaticProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, catalog: ImageCatalog) -> Self {
        self.images.insert(catalog.path.clone(), catalog);
        self
    }
}

impl ImageProgrammer for StaticProgrammer {
    fn program(&self, _device_id: DeviceId, path: &Path) -> Result<ImageCatalog, ResourceError> {
        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| ResourceError::ImageLoad(format!("unknown image {}", path.display())))
    }
}
