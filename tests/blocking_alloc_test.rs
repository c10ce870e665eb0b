// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Blocking allocation against concurrent releases, cancellation and
//! shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use accel_rm::inventory::{CuDescriptor, ImageCatalog};
use accel_rm::request::{CuListProperty, CuProperty};
use accel_rm::{ManagerLimits, ResourceError, ResourceManager, StaticProgrammer};

const IMAGE: &str = "/images/single.json";
const INTERVAL_US: u64 = 100_000;

fn manager() -> Arc<ResourceManager> {
    let catalog = ImageCatalog::new(
        uuid::Uuid::from_u128(0x51),
        IMAGE,
        vec![CuDescriptor::new("enc", "enc_0")],
    );
    let manager = Arc::new(ResourceManager::new(
        ManagerLimits::default(),
        Arc::new(StaticProgrammer::new().with_image(catalog)),
    ));
    manager.enable_device(0).unwrap();
    manager.load_image(Some(0), Path::new(IMAGE)).unwrap();
    manager
}

fn full_enc() -> CuProperty {
    CuProperty { kernel_name: "enc".into(), request_load: 100, ..Default::default() }
}

#[tokio::test]
async fn waits_for_concurrent_release() {
    let manager = manager();
    let holder = manager.create_session(1).unwrap();
    let waiter = manager.create_session(1).unwrap();
    let held = holder.cu_alloc(&full_enc()).unwrap();

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        holder.cu_release(&held).unwrap();
        holder
    });

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let granted = waiter.cu_blocking_alloc(&full_enc(), INTERVAL_US, &cancel).await.unwrap();
    assert!(started.elapsed() >= Duration::from_micros(INTERVAL_US));
    assert_eq!(granted.cu.kernel_name, "enc");

    let _holder = releaser.await.unwrap();
    manager.read(|state| assert_eq!(state.ledger().len(), 1));
}

#[tokio::test]
async fn free_capacity_grants_without_waiting() {
    let manager = manager();
    let session = manager.create_session(1).unwrap();
    let cancel = CancellationToken::new();
    let started = Instant::now();
    session.cu_blocking_alloc(&full_enc(), INTERVAL_US, &cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_micros(INTERVAL_US));
}

#[tokio::test]
async fn cancellation_stops_waiting() {
    let manager = manager();
    let holder = manager.create_session(1).unwrap();
    let waiter = manager.create_session(1).unwrap();
    let _held = holder.cu_alloc(&full_enc()).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = waiter.cu_blocking_alloc(&full_enc(), INTERVAL_US, &cancel).await.unwrap_err();
    assert!(matches!(err, ResourceError::Cancelled));
    manager.read(|state| assert_eq!(state.ledger().len(), 1));
}

#[tokio::test]
async fn non_retryable_error_returns_at_once() {
    let manager = manager();
    let session = manager.create_session(1).unwrap();
    let cancel = CancellationToken::new();
    let bad = CuProperty { kernel_name: "enc".into(), request_load: 0, ..Default::default() };
    let err = session.cu_blocking_alloc(&bad, INTERVAL_US, &cancel).await.unwrap_err();
    assert!(matches!(err, ResourceError::InvalidArgument(_)));
}

#[tokio::test]
async fn interval_above_limit_is_rejected() {
    let manager = manager();
    let session = manager.create_session(1).unwrap();
    let cancel = CancellationToken::new();
    let err = session.cu_blocking_alloc(&full_enc(), 1_000_001, &cancel).await.unwrap_err();
    assert!(matches!(err, ResourceError::InvalidArgument(_)));
}

#[tokio::test]
async fn blocking_list_waits_for_whole_list() {
    let manager = manager();
    let holder = manager.create_session(1).unwrap();
    let waiter = manager.create_session(1).unwrap();
    let half = CuProperty { kernel_name: "enc".into(), request_load: 50, ..Default::default() };
    let held = holder.cu_alloc(&CuProperty { request_load: 60, ..half.clone() }).unwrap();

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        holder.cu_release(&held).unwrap();
        holder
    });

    let list = CuListProperty { cu_props: vec![half.clone(), half], ..Default::default() };
    let cancel = CancellationToken::new();
    let granted = waiter.cu_list_blocking_alloc(&list, 20_000, &cancel).await.unwrap();
    assert_eq!(granted.len(), 2);
    assert_eq!(granted[0].service_id, granted[1].service_id);
    let _holder = releaser.await.unwrap();
}
