// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Devices programmed from JSON image manifests on disk.

use std::io::Write;
use std::sync::Arc;

use accel_rm::request::{CuPoolPropertyV2, CuProperty};
use accel_rm::{ManagerLimits, ManifestProgrammer, PoolId, ResourceError, ResourceManager};

const CODEC_UUID: &str = "6f1e6a3c-0d7e-4b8e-9a51-1c2d3e4f5a6b";

fn manifest(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

fn codec_manifest() -> tempfile::NamedTempFile {
    manifest(&format!(
        r#"{{
  "uuid": "{CODEC_UUID}",
  "compute_units": [
    {{ "kernel_name": "enc", "instance_name": "enc_0", "max_capacity": 500000 }},
    {{ "kernel_name": "dec", "kernel_alias": "DEC", "instance_name": "dec_0", "mem_bank": {{ "id": 1 }} }}
  ]
}}"#
    ))
}

fn scaler_manifest() -> tempfile::NamedTempFile {
    manifest(
        r#"{
  "uuid": "00000000-0000-4000-8000-00000000beef",
  "compute_units": [ { "kernel_name": "scl", "instance_name": "scl_0" } ]
}"#,
    )
}

fn manager(devices: u32) -> Arc<ResourceManager> {
    let manager = Arc::new(ResourceManager::new(ManagerLimits::default(), Arc::new(ManifestProgrammer)));
    for id in 0..devices {
        manager.enable_device(id).unwrap();
    }
    manager
}

fn kernel(name: &str, load: i32) -> CuProperty {
    CuProperty { kernel_name: name.into(), request_load: load, ..Default::default() }
}

#[test]
fn manifest_capacity_bounds_allocation() {
    let codec = codec_manifest();
    let manager = manager(1);
    assert_eq!(manager.load_image(None, codec.path()).unwrap(), 0);

    let session = manager.create_session(1).unwrap();
    let err = session.cu_alloc(&kernel("enc", 60)).unwrap_err();
    assert!(err.is_insufficient_resources(), "unexpected error: {err:?}");

    let granted = session.cu_alloc(&kernel("enc", 50)).unwrap();
    assert_eq!(granted.cu.max_capacity.units(), 500_000);
    assert_eq!(session.check_cu_available_num(&kernel("enc", 1)).unwrap(), 0);
}

#[test]
fn alias_and_bank_come_from_manifest() {
    let codec = codec_manifest();
    let manager = manager(1);
    manager.load_image(Some(0), codec.path()).unwrap();

    let session = manager.create_session(1).unwrap();
    let by_alias = CuProperty { kernel_alias: "DEC".into(), request_load: 10, ..Default::default() };
    let granted = session.cu_alloc(&by_alias).unwrap();
    assert_eq!(granted.cu.kernel_name, "dec");
    assert_eq!(granted.cu.mem_bank.id, 1);
    assert_eq!(granted.cu.uuid.to_string(), CODEC_UUID);
}

#[test]
fn alloc_with_load_programs_idle_device() {
    let codec = codec_manifest();
    let scaler = scaler_manifest();
    let manager = manager(2);
    manager.load_image(Some(0), codec.path()).unwrap();

    let session = manager.create_session(1).unwrap();
    assert!(matches!(session.cu_alloc(&kernel("scl", 20)), Err(ResourceError::NotFound(_))));

    let granted = session.cu_alloc_with_load(&kernel("scl", 20), scaler.path()).unwrap();
    assert_eq!(granted.cu.device_id, 1);
    assert_eq!(manager.health_report().devices_loaded, 2);
}

#[test]
fn broken_manifest_is_image_load_error() {
    let broken = manifest(r#"{ "uuid": "not-a-uuid", "compute_units": [] }"#);
    let manager = manager(1);
    let err = manager.load_image(Some(0), broken.path()).unwrap_err();
    assert!(matches!(err, ResourceError::ImageLoad(_)));
    assert_eq!(manager.health_report().devices_loaded, 0);
}

#[test]
fn image_pool_on_allowed_device_hides_it_from_default_pool() {
    let codec = codec_manifest();
    let manager = manager(2);
    manager.load_image(Some(0), codec.path()).unwrap();
    manager.load_image(Some(1), codec.path()).unwrap();

    let owner = manager.create_session(1).unwrap();
    let prop = CuPoolPropertyV2 {
        xclbin_uuid: CODEC_UUID.parse().unwrap(),
        xclbin_num: 1,
        device_id_list: vec![1],
        ..Default::default()
    };
    let (pool_id, info) = owner.cu_pool_reserve_v2(&prop).unwrap();
    assert_ne!(pool_id, PoolId::DEFAULT);
    assert_eq!(info.images, vec![1]);
    assert_eq!(info.devices, vec![1]);

    let outside = owner.cu_alloc(&kernel("dec", 10)).unwrap();
    assert_eq!(outside.cu.device_id, 0);
    let inside = owner.cu_alloc(&CuProperty { pool_id: pool_id.0, ..kernel("dec", 10) }).unwrap();
    assert_eq!(inside.cu.device_id, 1);
    assert_eq!(inside.pool_id, pool_id);
}
