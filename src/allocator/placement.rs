// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Placement search shared by leasing and pool reservation.
//!
//! A [`Placer`] decides what "taking" a CU means: opening a channel for a
//! lease, or carving the whole CU into a pool. The search itself is the
//! same for both and always undoes its own partial work on failure.

use crate::error::{ResourceError, ResourceResult};
use crate::inventory::{CandidateFilter, ChannelSpec, Inventory, Scope};
use crate::types::{ChannelRef, ClientId, CuRef, DeviceId, PoolId, ServiceId};

use super::{CuListRequest, CuRequest};

pub(crate) trait Placer {
    type Token: Copy;

    fn scope(&self, req: &CuRequest) -> Scope;
    fn place(&mut self, inv: &mut Inventory, cu: CuRef, req: &CuRequest) -> ResourceResult<Self::Token>;
    fn undo(&mut self, inv: &mut Inventory, token: Self::Token);
    fn cu_of(token: &Self::Token) -> CuRef;
}

/// Opens one channel per member under a single service id.
pub(crate) struct LeasePlacer {
    pub service_id: ServiceId,
    pub client_id: ClientId,
}

impl Placer for LeasePlacer {
    type Token = ChannelRef;

    fn scope(&self, req: &CuRequest) -> Scope {
        Scope::Lease(req.pool_id)
    }

    fn place(&mut self, inv: &mut Inventory, cu: CuRef, req: &CuRequest) -> ResourceResult<ChannelRef> {
        let spec = ChannelSpec {
            load: req.load,
            granularity: req.granularity,
            exclusive: req.exclusive,
            service_id: self.service_id,
            client_id: self.client_id,
            pool_id: req.pool_id,
        };
        inv.reserve_load(cu, &spec)
    }

    fn undo(&mut self, inv: &mut Inventory, token: ChannelRef) {
        if let Err(e) = inv.release_load(token, self.service_id) {
            tracing::error!(channel = %token, error = %e, "rollback could not close channel");
        }
    }

    fn cu_of(token: &ChannelRef) -> CuRef {
        token.cu()
    }
}

/// Carves whole CUs into a pool.
pub(crate) struct ClaimPlacer {
    pub pool_id: PoolId,
}

impl Placer for ClaimPlacer {
    type Token = CuRef;

    fn scope(&self, _req: &CuRequest) -> Scope {
        Scope::Claim
    }

    fn place(&mut self, inv: &mut Inventory, cu: CuRef, req: &CuRequest) -> ResourceResult<CuRef> {
        inv.claim(cu, self.pool_id, req.load).map(|_| cu)
    }

    fn undo(&mut self, inv: &mut Inventory, token: CuRef) {
        inv.unclaim(token, self.pool_id);
    }

    fn cu_of(token: &CuRef) -> CuRef {
        *token
    }
}

/// One member of a list, placed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placed<T> {
    pub member: usize,
    pub token: T,
}

/// Combine a call-level filter with the request's own constraints.
fn merge_filter(req: &CuRequest, base: &CandidateFilter) -> ResourceResult<CandidateFilter> {
    let mut filter = base.clone();
    if let Some(device) = req.constraints.device.hardware_index() {
        match filter.device {
            Some(pinned) if pinned != device => {
                return Err(ResourceError::InvalidConstraint(format!(
                    "request pins device {} but the call targets device {}",
                    device, pinned
                )))
            }
            _ => filter.device = Some(device),
        }
    }
    if let Some(bank) = req.constraints.memory.bank() {
        filter.memory_bank = Some(bank);
    }
    Ok(filter)
}

/// Place one request on the first feasible candidate.
pub(crate) fn place_single<P: Placer>(
    inv: &mut Inventory,
    placer: &mut P,
    req: &CuRequest,
    base: &CandidateFilter,
) -> ResourceResult<P::Token> {
    let filter = merge_filter(req, base)?;
    let mut candidates = inv.find_candidates(&req.matcher, &filter, placer.scope(req));
    inv.order_by_policy(&mut candidates, req.constraints.policy);

    let mut failure = ResourceError::NotFound(format!("no {} available", req.matcher));
    for cu in candidates {
        match placer.place(inv, cu, req) {
            Ok(token) => return Ok(token),
            Err(e) => failure = failure.prefer(e),
        }
    }
    Err(failure)
}

enum Unit {
    Single(usize),
    /// Members that must share one device.
    Colocated(Vec<usize>),
}

fn partition(list: &CuListRequest) -> Vec<Unit> {
    if list.same_device {
        return vec![Unit::Colocated((0..list.members.len()).collect())];
    }
    let mut units = Vec::new();
    let mut groups: Vec<(u32, usize)> = Vec::new();
    for (idx, member) in list.members.iter().enumerate() {
        match member.constraints.device.virtual_index() {
            Some(vidx) => match groups.iter().find(|(v, _)| *v == vidx) {
                Some(&(_, unit)) => {
                    if let Unit::Colocated(members) = &mut units[unit] {
                        members.push(idx);
                    }
                }
                None => {
                    groups.push((vidx, units.len()));
                    units.push(Unit::Colocated(vec![idx]));
                }
            },
            None => units.push(Unit::Single(idx)),
        }
    }
    units
}

/// Place every member of `list` or nothing. Returned placements are in
/// member order.
pub(crate) fn place_list<P: Placer>(
    inv: &mut Inventory,
    placer: &mut P,
    list: &CuListRequest,
    base: &CandidateFilter,
) -> ResourceResult<Vec<Placed<P::Token>>> {
    let requested = list.members.len();
    let mut placed: Vec<Placed<P::Token>> = Vec::with_capacity(requested);
    let mut colocated_devices: Vec<DeviceId> = Vec::new();

    for unit in partition(list) {
        let outcome = match &unit {
            Unit::Single(idx) => place_single(inv, placer, &list.members[*idx], base)
                .map(|token| vec![Placed { member: *idx, token }]),
            Unit::Colocated(members) => {
                place_colocated(inv, placer, list, members, base, &colocated_devices).map(
                    |(device, batch)| {
                        colocated_devices.push(device);
                        batch
                    },
                )
            }
        };
        match outcome {
            Ok(mut batch) => placed.append(&mut batch),
            Err(cause) => {
                let count = placed.len();
                rollback(inv, placer, placed);
                return Err(match cause {
                    ResourceError::InvalidArgument(_) | ResourceError::InvalidConstraint(_) => cause,
                    cause => ResourceError::PartialAllocationFailure {
                        placed: count,
                        requested,
                        cause: Box::new(cause),
                    },
                });
            }
        }
    }
    placed.sort_by_key(|p| p.member);
    Ok(placed)
}

pub(crate) fn rollback<P: Placer>(inv: &mut Inventory, placer: &mut P, placed: Vec<Placed<P::Token>>) {
    for p in placed.into_iter().rev() {
        placer.undo(inv, p.token);
    }
}

/// Find one device, not in `taken`, that hosts every member at once.
fn place_colocated<P: Placer>(
    inv: &mut Inventory,
    placer: &mut P,
    list: &CuListRequest,
    members: &[usize],
    base: &CandidateFilter,
    taken: &[DeviceId],
) -> ResourceResult<(DeviceId, Vec<Placed<P::Token>>)> {
    let mut ordered = Vec::with_capacity(members.len());
    for &idx in members {
        ordered.push((idx, merge_filter(&list.members[idx], base)?));
    }
    // Identical requests sit next to each other so the cover can skip
    // permutations of the same assignment.
    let first_equal = |idx: usize| {
        members
            .iter()
            .position(|&j| list.members[j] == list.members[idx])
            .unwrap_or(0)
    };
    ordered.sort_by_key(|(idx, _)| first_equal(*idx));

    let mut pinned = None;
    for (_, filter) in &ordered {
        if let Some(device) = filter.device {
            match pinned {
                Some(p) if p != device => {
                    return Err(ResourceError::InvalidConstraint(format!(
                        "colocated members pin devices {} and {}",
                        p, device
                    )))
                }
                _ => pinned = Some(device),
            }
        }
    }
    let mut device_filter = base.clone();
    if pinned.is_some() {
        device_filter.device = pinned;
    }

    let mut failure = ResourceError::NotFound(format!(
        "no single device hosts all {} colocated CUs",
        members.len()
    ));
    for device in inv.ready_devices(&device_filter) {
        if taken.contains(&device) {
            continue;
        }
        let mut acc = Vec::with_capacity(ordered.len());
        match cover(inv, placer, list, &ordered, device, &mut acc) {
            Ok(()) => return Ok((device, acc)),
            Err(e) => failure = failure.prefer(e),
        }
    }
    Err(failure)
}

/// Backtracking exact cover of `members[acc.len()..]` on one device.
fn cover<P: Placer>(
    inv: &mut Inventory,
    placer: &mut P,
    list: &CuListRequest,
    members: &[(usize, CandidateFilter)],
    device: DeviceId,
    acc: &mut Vec<Placed<P::Token>>,
) -> ResourceResult<()> {
    let depth = acc.len();
    let Some((idx, filter)) = members.get(depth) else {
        return Ok(());
    };
    let req = &list.members[*idx];
    let mut filter = filter.clone();
    filter.device = Some(device);

    // Same request as the previous member: never pick a lower CU than it did.
    let floor = match (depth.checked_sub(1).and_then(|d| members.get(d)), acc.last()) {
        (Some((prev, _)), Some(last)) if list.members[*prev] == *req => Some(P::cu_of(&last.token).cu_id),
        _ => None,
    };

    let mut failure = ResourceError::NotFound(format!("no {} on device {}", req.matcher, device));
    for cu in inv.find_candidates(&req.matcher, &filter, placer.scope(req)) {
        if floor.map_or(false, |f| cu.cu_id < f) {
            continue;
        }
        match placer.place(inv, cu, req) {
            Ok(token) => {
                acc.push(Placed { member: *idx, token });
                match cover(inv, placer, list, members, device, acc) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        failure = failure.prefer(e);
                        if let Some(p) = acc.pop() {
                            placer.undo(inv, p.token);
                        }
                    }
                }
            }
            Err(e) => failure = failure.prefer(e),
        }
    }
    Err(failure)
}
