// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

use uuid::Uuid;

use super::*;
use crate::constraint::{DeviceConstraint, Policy};
use crate::group::GroupDefinition;
use crate::inventory::{CuDescriptor, ImageCatalog};

const CLIENT: ClientId = ClientId(7);

fn state_with(images: &[Vec<CuDescriptor>]) -> ManagerState {
    let mut state = ManagerState::new(ManagerLimits::default());
    for (id, cus) in images.iter().enumerate() {
        let id = id as DeviceId;
        let catalog = ImageCatalog::new(Uuid::new_v4(), format!("/images/dev{}.json", id), cus.clone());
        state.inventory.enable_device(id).unwrap();
        state.inventory.install_image(id, &catalog).unwrap();
    }
    state
}

fn cu(kernel: &str, instance: &str) -> CuDescriptor {
    CuDescriptor::new(kernel, instance)
}

fn pct(p: u32) -> Load {
    Load::from_percent(p).unwrap()
}

fn req(kernel: &str, percent: u32) -> CuRequest {
    CuRequest::new(CuMatcher::kernel(kernel), pct(percent))
}

fn on_virtual(r: CuRequest, index: u32) -> CuRequest {
    let constraints = Constraints { device: DeviceConstraint::VirtualIndex(index), ..Default::default() };
    r.with_constraints(constraints)
}

fn with_policy(r: CuRequest, policy: Policy) -> CuRequest {
    let constraints = Constraints { policy, ..Default::default() };
    r.with_constraints(constraints)
}

#[test]
fn capacity_is_returned_on_release() {
    let mut state = state_with(&[vec![cu("video_decode", "vd_0")]]);

    let first = state.allocate_cu(CLIENT, &req("video_decode", 40)).unwrap();
    assert_eq!(first.channel_id, 0);
    assert_eq!(first.channel_load(), 40);

    let err = state.allocate_cu(CLIENT, &req("video_decode", 70)).unwrap_err();
    assert!(matches!(err, ResourceError::CapacityExceeded { .. }));

    state.release(&[first.descriptor()]).unwrap();
    let again = state.allocate_cu(CLIENT, &req("video_decode", 70)).unwrap();
    assert_eq!(again.cu.cu_name, "video_decode:vd_0");
    assert_eq!(state.ledger.len(), 1);
}

#[test]
fn grant_reports_inventory_details() {
    let mut state = state_with(&[vec![cu("enc", "enc_0").with_alias("ENC").with_bank(2)]]);
    let granted = state.allocate_cu(CLIENT, &req("enc", 25)).unwrap();
    assert_eq!(granted.cu.kernel_alias, "ENC");
    assert_eq!(granted.cu.mem_bank.id, 2);
    assert_eq!(granted.cu.image_path, std::path::PathBuf::from("/images/dev0.json"));
    assert_eq!(granted.pool_id, PoolId::DEFAULT);
    assert_eq!(granted.service_id, ServiceId(1));
}

#[test]
fn unknown_kernel_is_not_found() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")]]);
    let err = state.allocate_cu(CLIENT, &req("dec", 10)).unwrap_err();
    assert!(matches!(err, ResourceError::NotFound(_)));
}

#[test]
fn zero_load_is_rejected() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")]]);
    let err = state.allocate_cu(CLIENT, &CuRequest::new(CuMatcher::kernel("enc"), Load::ZERO)).unwrap_err();
    assert!(matches!(err, ResourceError::InvalidArgument(_)));
}

#[test]
fn unknown_pool_is_not_found() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")]]);
    let err = state.allocate_cu(CLIENT, &req("enc", 10).in_pool(PoolId(3))).unwrap_err();
    assert!(matches!(err, ResourceError::NotFound(_)));
}

#[test]
fn allocation_from_named_device() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")], vec![cu("enc", "enc_0")]]);
    let granted = state.allocate_cu_from_device(CLIENT, 1, &req("enc", 10)).unwrap();
    assert_eq!(granted.cu.device_id, 1);

    let err = state.allocate_cu_from_device(CLIENT, 5, &req("enc", 10)).unwrap_err();
    assert_eq!(err, ResourceError::DeviceNotFound(5));

    let pinned = req("enc", 10).with_constraints(Constraints {
        device: DeviceConstraint::HardwareIndex(0),
        ..Default::default()
    });
    let err = state.allocate_cu_from_device(CLIENT, 1, &pinned).unwrap_err();
    assert!(matches!(err, ResourceError::InvalidConstraint(_)));
}

#[test]
fn exclusive_lease_locks_the_device() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("enc", "enc_1")]]);
    let exclusive = state.allocate_cu(CLIENT, &req("enc", 10).exclusive()).unwrap();

    let err = state.allocate_cu(ClientId(8), &req("enc", 10)).unwrap_err();
    assert_eq!(err, ResourceError::ExclusivityConflict(0));

    state.release(&[exclusive.descriptor()]).unwrap();
    let shared = state.allocate_cu(ClientId(8), &req("enc", 10)).unwrap();

    let err = state.allocate_cu(CLIENT, &req("enc", 10).exclusive()).unwrap_err();
    assert_eq!(err, ResourceError::ExclusivityConflict(0));
    state.release(&[shared.descriptor()]).unwrap();
}

#[test]
fn exclusive_list_may_hold_several_cus_of_its_device() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("dec", "dec_0")]]);
    let list = CuListRequest::new(vec![req("enc", 100).exclusive(), req("dec", 100).exclusive()]);
    let granted = state.allocate_cu_list(CLIENT, &list).unwrap();
    assert_eq!(granted.len(), 2);
    assert_eq!(state.inventory.device(0).unwrap().exclusive_holder(), Some(granted[0].service_id));

    state.release(&[granted[0].descriptor(), granted[1].descriptor()]).unwrap();
    assert_eq!(state.inventory.device(0).unwrap().exclusive_holder(), None);
}

#[test]
fn policies_reorder_candidates() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("enc", "enc_1")]]);
    let plain = state.allocate_cu(CLIENT, &req("enc", 30)).unwrap();
    assert_eq!(plain.cu.cu_id, 0);

    let least = state.allocate_cu(CLIENT, &with_policy(req("enc", 10), Policy::CuLeastUsedFirst)).unwrap();
    assert_eq!(least.cu.cu_id, 1);

    let most = state.allocate_cu(CLIENT, &with_policy(req("enc", 10), Policy::CuMostUsedFirst)).unwrap();
    assert_eq!(most.cu.cu_id, 0);
}

#[test]
fn device_policies_compare_whole_devices() {
    let mut state = state_with(&[
        vec![cu("enc", "enc_0"), cu("scl", "scl_0")],
        vec![cu("enc", "enc_0"), cu("scl", "scl_0")],
    ]);
    state.allocate_cu(CLIENT, &req("scl", 50)).unwrap();

    let least = state.allocate_cu(CLIENT, &with_policy(req("enc", 10), Policy::DevLeastUsedFirst)).unwrap();
    assert_eq!(least.cu.device_id, 1);

    let most = state.allocate_cu(CLIENT, &with_policy(req("enc", 10), Policy::DevMostUsedFirst)).unwrap();
    assert_eq!(most.cu.device_id, 0);
}

#[test]
fn failed_list_leaves_inventory_untouched() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("dec", "dec_0")]]);
    let before = state.inventory.clone();

    let list = CuListRequest::new(vec![req("enc", 60), req("dec", 60), req("dec", 60)]);
    let err = state.allocate_cu_list(CLIENT, &list).unwrap_err();
    match err {
        ResourceError::PartialAllocationFailure { placed, requested, cause } => {
            assert_eq!((placed, requested), (2, 3));
            assert!(matches!(*cause, ResourceError::CapacityExceeded { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(state.inventory, before);
    assert!(state.ledger.is_empty());
}

#[test]
fn invalid_list_member_is_not_wrapped() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")], vec![cu("enc", "enc_0")]]);
    let list = CuListRequest::new(vec![
        req("enc", 10).with_constraints(Constraints { device: DeviceConstraint::HardwareIndex(0), ..Default::default() }),
        req("enc", 10).with_constraints(Constraints { device: DeviceConstraint::HardwareIndex(1), ..Default::default() }),
    ])
    .same_device();
    let err = state.allocate_cu_list(CLIENT, &list).unwrap_err();
    assert!(matches!(err, ResourceError::InvalidConstraint(_)));
}

#[test]
fn list_members_share_one_service_id() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("dec", "dec_0")]]);
    let granted = state
        .allocate_cu_list(CLIENT, &CuListRequest::new(vec![req("enc", 50), req("dec", 50)]))
        .unwrap();
    assert_eq!(granted[0].service_id, granted[1].service_id);
    assert_eq!(granted[0].cu.kernel_name, "enc");
    assert_eq!(granted[1].cu.kernel_name, "dec");
    assert_eq!(state.ledger.get(granted[0].service_id).unwrap().kind, LeaseKind::CuList);
}

#[test]
fn same_device_list_finds_a_device_hosting_everything() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")], vec![cu("enc", "enc_0"), cu("dec", "dec_0")]]);
    let list = CuListRequest::new(vec![req("enc", 50), req("dec", 50)]).same_device();
    let granted = state.allocate_cu_list(CLIENT, &list).unwrap();
    assert!(granted.iter().all(|r| r.cu.device_id == 1));
}

#[test]
fn same_device_list_covers_identical_members_exactly() {
    let mut state = state_with(&[
        vec![cu("enc", "enc_0"), cu("enc", "enc_1")],
        vec![cu("enc", "enc_0"), cu("enc", "enc_1"), cu("enc", "enc_2")],
    ]);
    let list = CuListRequest::new(vec![req("enc", 100), req("enc", 100), req("enc", 100)]).same_device();
    let granted = state.allocate_cu_list(CLIENT, &list).unwrap();
    let mut cus: Vec<_> = granted.iter().map(|r| (r.cu.device_id, r.cu.cu_id)).collect();
    cus.sort_unstable();
    assert_eq!(cus, vec![(1, 0), (1, 1), (1, 2)]);
}

#[test]
fn virtual_indexes_split_across_devices() {
    let image = vec![cu("enc", "enc_0"), cu("dec", "dec_0")];
    let mut state = state_with(&[image.clone(), image]);
    let list = CuListRequest::new(vec![
        on_virtual(req("enc", 10), 0),
        on_virtual(req("dec", 10), 0),
        on_virtual(req("enc", 10), 1),
        on_virtual(req("dec", 10), 1),
    ]);
    let granted = state.allocate_cu_list(CLIENT, &list).unwrap();
    let devices: Vec<DeviceId> = granted.iter().map(|r| r.cu.device_id).collect();
    assert_eq!(devices[0], devices[1]);
    assert_eq!(devices[2], devices[3]);
    assert_ne!(devices[0], devices[2]);
}

#[test]
fn virtual_group_without_distinct_device_fails_whole_list() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("enc", "enc_1")]]);
    let before = state.inventory.clone();
    let list = CuListRequest::new(vec![on_virtual(req("enc", 10), 0), on_virtual(req("enc", 10), 1)]);
    let err = state.allocate_cu_list(CLIENT, &list).unwrap_err();
    assert!(matches!(err, ResourceError::PartialAllocationFailure { placed: 1, .. }));
    assert_eq!(state.inventory, before);
}

#[test]
fn group_falls_back_to_the_next_option() {
    let mut state = state_with(&[
        vec![cu("enc", "enc_0")],
        vec![cu("dec", "dec_0")],
        vec![cu("enc2", "enc2_0")],
    ]);
    let limits = state.limits.clone();
    let option_a = CuListRequest::new(vec![
        CuRequest::new(CuMatcher::cu_name("enc:enc_0"), pct(50)),
        CuRequest::new(CuMatcher::cu_name("dec:dec_0"), pct(50)),
    ])
    .same_device();
    let option_b = CuListRequest::new(vec![CuRequest::new(CuMatcher::cu_name("enc2:enc2_0"), pct(100))]);
    state
        .groups
        .declare(GroupDefinition { name: "g1".into(), options: vec![option_a, option_b] }, &limits)
        .unwrap();

    let granted = state.allocate_cu_group(CLIENT, "g1", PoolId::DEFAULT).unwrap();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].cu.kernel_name, "enc2");

    let lease = state.ledger.get(granted[0].service_id).unwrap();
    assert_eq!(lease.kind, LeaseKind::CuGroup);
    assert_eq!(lease.group_name.as_deref(), Some("g1"));
    assert_eq!(state.inventory.live_channel_count(), 1);

    let err = state.allocate_cu_group(CLIENT, "g1", PoolId::DEFAULT).unwrap_err();
    assert!(matches!(err, ResourceError::NotFound(_)));
    assert!(matches!(
        state.allocate_cu_group(CLIENT, "missing", PoolId::DEFAULT),
        Err(ResourceError::NotFound(_))
    ));
}

#[test]
fn release_must_match_the_live_lease_exactly() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("dec", "dec_0")]]);
    let granted = state
        .allocate_cu_list(CLIENT, &CuListRequest::new(vec![req("enc", 50), req("dec", 50)]))
        .unwrap();
    let before = state.inventory.clone();

    let partial = [granted[0].descriptor()];
    assert!(matches!(state.release(&partial), Err(ResourceError::StaleDescriptor(_))));

    let mut wrong_channel = granted[1].descriptor();
    wrong_channel.channel.channel_id = 9;
    assert!(matches!(
        state.release(&[granted[0].descriptor(), wrong_channel]),
        Err(ResourceError::StaleDescriptor(_))
    ));

    let mut wrong_service = granted[0].descriptor();
    wrong_service.service_id = ServiceId(999);
    assert!(matches!(state.release(&[wrong_service]), Err(ResourceError::StaleDescriptor(_))));

    assert_eq!(state.inventory, before);
    assert_eq!(state.ledger.len(), 1);

    let full = [granted[1].descriptor(), granted[0].descriptor()];
    let lease = state.release(&full).unwrap();
    assert_eq!(lease.channels.len(), 2);
    assert!(matches!(state.release(&full), Err(ResourceError::StaleDescriptor(_))));
    assert!(matches!(state.release(&[]), Err(ResourceError::InvalidArgument(_))));
}

#[test]
fn available_count_is_a_dry_run() {
    let image = vec![cu("enc", "enc_0"), cu("dec", "dec_0")];
    let mut state = state_with(&[image.clone(), image]);
    let before = state.inventory.clone();

    assert_eq!(state.cu_available_count(&req("enc", 30)).unwrap(), 6);
    let list = CuListRequest::new(vec![req("enc", 50), req("dec", 50)]);
    assert_eq!(state.cu_list_available_count(&list).unwrap(), 4);
    assert_eq!(state.cu_list_available_count(&list.clone().same_device()).unwrap(), 4);
    assert_eq!(state.inventory, before);

    state.allocate_cu(CLIENT, &req("enc", 100)).unwrap();
    assert_eq!(state.cu_available_count(&req("enc", 30)).unwrap(), 3);
    assert_eq!(state.cu_available_count(&req("missing", 30)).unwrap(), 0);
    assert!(matches!(
        state.cu_available_count(&CuRequest::new(CuMatcher::kernel("enc"), Load::ZERO)),
        Err(ResourceError::InvalidArgument(_))
    ));
}

#[test]
fn group_available_count_uses_any_option() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")], vec![cu("enc2", "enc2_0")]]);
    let limits = state.limits.clone();
    let options = vec![
        CuListRequest::new(vec![CuRequest::new(CuMatcher::cu_name("enc:enc_0"), pct(50))]),
        CuListRequest::new(vec![CuRequest::new(CuMatcher::cu_name("enc2:enc2_0"), pct(100))]),
    ];
    state.groups.declare(GroupDefinition { name: "g".into(), options }, &limits).unwrap();
    assert_eq!(state.cu_group_available_count("g", PoolId::DEFAULT).unwrap(), 3);
    assert!(state.cu_group_available_count("nope", PoolId::DEFAULT).is_err());
}

#[test]
fn channel_cap_bounds_shared_cus() {
    let mut state = ManagerState::new(ManagerLimits { max_channels_per_cu: 2, ..Default::default() });
    let catalog = ImageCatalog::new(Uuid::new_v4(), "/images/enc.json", vec![cu("enc", "enc_0")]);
    state.inventory.enable_device(0).unwrap();
    state.inventory.install_image(0, &catalog).unwrap();

    assert_eq!(state.cu_available_count(&req("enc", 1)).unwrap(), 2);
    state.allocate_cu(CLIENT, &req("enc", 1)).unwrap();
    state.allocate_cu(CLIENT, &req("enc", 1)).unwrap();
    assert!(matches!(
        state.allocate_cu(CLIENT, &req("enc", 1)),
        Err(ResourceError::CapacityExceeded { available: 0, .. })
    ));
}

#[test]
fn status_and_capacity_queries() {
    let mut state = state_with(&[vec![cu("enc", "enc_0").with_capacity(pct(80)), cu("dec", "dec_0")]]);
    let enc = CuRef { device_id: 0, cu_id: 0 };
    assert_eq!(state.cu_status(enc).unwrap(), CuStatus { is_busy: false, used_load: Load::ZERO });

    state.allocate_cu(CLIENT, &req("enc", 40)).unwrap();
    assert_eq!(state.cu_status(enc).unwrap(), CuStatus { is_busy: true, used_load: pct(40) });
    assert!(state.cu_status(CuRef { device_id: 0, cu_id: 9 }).is_err());

    assert_eq!(state.cu_max_capacity(&CuMatcher::kernel("enc")), pct(80));
    assert_eq!(state.cu_max_capacity(&CuMatcher::kernel("dec")), Load::FULL);
    assert_eq!(state.cu_max_capacity(&CuMatcher::kernel("missing")), Load::ZERO);
}

#[test]
fn allocation_query_filters_by_kernel() {
    let mut state = state_with(&[vec![cu("enc", "enc_0"), cu("dec", "dec_0")]]);
    let granted = state
        .allocate_cu_list(CLIENT, &CuListRequest::new(vec![req("enc", 50), req("dec", 50)]))
        .unwrap();
    let service_id = granted[0].service_id;

    assert_eq!(state.allocation_query(service_id, None).unwrap(), granted);
    let dec_only = state.allocation_query(service_id, Some(&CuMatcher::kernel("dec"))).unwrap();
    assert_eq!(dec_only.len(), 1);
    assert_eq!(dec_only[0].cu.kernel_name, "dec");
    assert!(matches!(state.allocation_query(ServiceId(42), None), Err(ResourceError::NotFound(_))));
}

#[test]
fn fine_granularity_round_trips_through_grants() {
    let mut state = state_with(&[vec![cu("enc", "enc_0")]]);
    let fine = CuRequest::new(CuMatcher::kernel("enc"), Load::from_units(333_333).unwrap())
        .with_granularity(Granularity::Fine);
    let granted = state.allocate_cu(CLIENT, &fine).unwrap();
    assert_eq!(granted.channel_load(), 333_333 << 8);
    assert_eq!(state.cu_available_count(&fine).unwrap(), 2);
}
