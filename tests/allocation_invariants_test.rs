// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Randomized allocate/release sequences, sequential and from several
//! threads at once.
//!
//! After every step: no CU is loaded past its capacity, an exclusively held
//! device carries channels of its holder only, and the lease ledger and the
//! inventory describe the same channels.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use accel_rm::inventory::{CuDescriptor, ImageCatalog};
use accel_rm::manager::ManagerState;
use accel_rm::request::{CuListProperty, CuProperty};
use accel_rm::types::CuRef;
use accel_rm::{CuResource, ManagerLimits, ResourceManager, Session, StaticProgrammer};

const IMAGE: &str = "/images/mixed.json";
const KERNELS: &[&str] = &["enc", "dec", "scl"];

fn manager(devices: u32) -> Arc<ResourceManager> {
    let catalog = ImageCatalog::new(
        uuid::Uuid::from_u128(0x5EED),
        IMAGE,
        vec![
            CuDescriptor::new("enc", "enc_0"),
            CuDescriptor::new("enc", "enc_1"),
            CuDescriptor::new("dec", "dec_0"),
            CuDescriptor::new("scl", "scl_0"),
        ],
    );
    let manager = Arc::new(ResourceManager::new(
        ManagerLimits::default(),
        Arc::new(StaticProgrammer::new().with_image(catalog)),
    ));
    for id in 0..devices {
        manager.enable_device(id).unwrap();
        manager.load_image(Some(id), Path::new(IMAGE)).unwrap();
    }
    manager
}

fn prop(kernel: &str, load: i32, exclusive: bool) -> CuProperty {
    CuProperty {
        kernel_name: kernel.to_string(),
        dev_excl: exclusive,
        request_load: load,
        ..Default::default()
    }
}

fn check_invariants(state: &ManagerState) {
    let mut inventory_channels = HashSet::new();
    for device in state.inventory().devices() {
        let holder = device.exclusive_holder();
        for cu in device.compute_units() {
            let used: u64 = cu.channels().map(|ch| u64::from(ch.load.units())).sum();
            assert!(
                used <= u64::from(cu.max_capacity.units()),
                "device {} cu {} over capacity: {}",
                device.id,
                cu.id,
                used
            );
            for ch in cu.channels() {
                if let Some(holder) = holder {
                    assert_eq!(ch.service_id, holder, "foreign channel on exclusive device {}", device.id);
                }
                inventory_channels.insert((device.id, cu.id, ch.id, ch.service_id));
            }
        }
    }

    let mut ledger_channels = HashSet::new();
    let mut granted_per_cu: HashMap<CuRef, u64> = HashMap::new();
    for lease in state.ledger().iter() {
        assert!(!lease.channels.is_empty());
        for ch in &lease.channels {
            assert!(ledger_channels.insert((ch.device_id, ch.cu_id, ch.channel_id, lease.service_id)));
            let live = state.inventory().channel(*ch).expect("leased channel is live");
            *granted_per_cu.entry(ch.cu()).or_default() += u64::from(live.load.units());
        }
    }
    assert_eq!(inventory_channels, ledger_channels);
    for (cu, granted) in granted_per_cu {
        let capacity = state.inventory().cu(cu).unwrap().max_capacity.units();
        assert!(granted <= u64::from(capacity), "{:?} granted {} past {}", cu, granted, capacity);
    }
}

/// One random allocate or release. Returns whether something was granted.
fn random_step(rng: &mut StdRng, sessions: &[Session], held: &mut Vec<(usize, Vec<CuResource>)>) -> bool {
    let who = rng.gen_range(0..sessions.len());
    let session = &sessions[who];
    match rng.gen_range(0..10) {
        0..=4 => {
            let kernel = KERNELS[rng.gen_range(0..KERNELS.len())];
            let exclusive = rng.gen_bool(0.1);
            if let Ok(res) = session.cu_alloc(&prop(kernel, rng.gen_range(1..=100), exclusive)) {
                held.push((who, vec![res]));
                return true;
            }
        }
        5..=6 => {
            let list = CuListProperty {
                cu_props: vec![prop("enc", rng.gen_range(1..=60), false), prop("dec", rng.gen_range(1..=60), false)],
                same_device: rng.gen_bool(0.5),
                ..Default::default()
            };
            if let Ok(res) = session.cu_list_alloc(&list) {
                assert_eq!(res.len(), 2);
                if list.same_device {
                    assert_eq!(res[0].cu.device_id, res[1].cu.device_id);
                }
                held.push((who, res));
                return true;
            }
        }
        _ => {
            if !held.is_empty() {
                let (owner, res) = held.swap_remove(rng.gen_range(0..held.len()));
                if res.len() == 1 {
                    sessions[owner].cu_release(&res[0]).unwrap();
                } else {
                    sessions[owner].cu_list_release(&res).unwrap();
                }
            }
        }
    }
    false
}

fn release_all(sessions: &[Session], held: &mut Vec<(usize, Vec<CuResource>)>) {
    for (owner, res) in held.drain(..) {
        sessions[owner].cu_list_release(&res).unwrap();
    }
}

fn run(seed: u64, steps: usize) {
    let manager = manager(3);
    let sessions: Vec<Session> = (0..2).map(|_| manager.create_session(1).unwrap()).collect();
    let mut held = Vec::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut granted = 0usize;

    for _ in 0..steps {
        if random_step(&mut rng, &sessions, &mut held) {
            granted += 1;
        }
        manager.read(check_invariants);
    }

    assert!(granted > 0, "seed {} never granted anything", seed);
    release_all(&sessions, &mut held);
    manager.read(|state| {
        check_invariants(state);
        assert!(state.ledger().is_empty());
    });
}

#[test]
fn random_sequences_keep_invariants() {
    for seed in [1, 7, 42, 1234, 99_999] {
        run(seed, 400);
    }
}

#[test]
fn closing_sessions_leaves_inventory_empty() {
    let manager = manager(2);
    let mut rng = StdRng::seed_from_u64(5);
    {
        let a = manager.create_session(1).unwrap();
        let b = manager.create_session(1).unwrap();
        for _ in 0..50 {
            let session = if rng.gen_bool(0.5) { &a } else { &b };
            let kernel = KERNELS[rng.gen_range(0..KERNELS.len())];
            let _ = session.cu_alloc(&prop(kernel, rng.gen_range(1..=50), false));
        }
        manager.read(check_invariants);
    }
    manager.read(|state| {
        assert!(state.ledger().is_empty());
        assert!(state.inventory().devices().all(|d| !d.has_live_channels()));
    });
    assert_eq!(manager.session_count(), 0);
}

#[test]
fn concurrent_sessions_never_overbook() {
    const WORKERS: u64 = 4;
    let manager = manager(2);
    let start = Arc::new(Barrier::new(WORKERS as usize));
    let done = Arc::new(AtomicBool::new(false));

    let checker = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut checks = 0usize;
            while !done.load(Ordering::Acquire) {
                manager.read(check_invariants);
                checks += 1;
                std::thread::yield_now();
            }
            checks
        })
    };

    let workers: Vec<_> = (0..WORKERS)
        .map(|seed| {
            let manager = Arc::clone(&manager);
            let start = Arc::clone(&start);
            std::thread::spawn(move || {
                let sessions = vec![manager.create_session(1).unwrap()];
                let mut held = Vec::new();
                let mut rng = StdRng::seed_from_u64(0xC0FFEE + seed);
                let mut granted = 0usize;
                start.wait();
                for _ in 0..300 {
                    if random_step(&mut rng, &sessions, &mut held) {
                        granted += 1;
                    }
                }
                release_all(&sessions, &mut held);
                granted
            })
        })
        .collect();

    let granted: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    done.store(true, Ordering::Release);
    let checks = checker.join().unwrap();

    assert!(granted > 0);
    assert!(checks > 0);
    manager.read(|state| {
        check_invariants(state);
        assert!(state.ledger().is_empty());
        assert!(state.inventory().devices().all(|d| !d.has_live_channels()));
    });
    assert_eq!(manager.session_count(), 0);
}
